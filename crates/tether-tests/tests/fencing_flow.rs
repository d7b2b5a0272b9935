use std::time::Duration;
use tether::protocol::{CANNOT_TERMINATE, FencingToken, Request, Response};
use tether_tests::harness::broker::TestBroker;
use tether_tests::harness::raw::RawConnection;
use tether_tests::wait_until;

#[tokio::test]
async fn token_from_a_dead_session_cannot_release_the_next_owner() {
    let broker = TestBroker::spawn(&["arm1"]).await.unwrap();

    let mut first = broker.client().await.unwrap();
    let stale = first.acquire("arm1").await.unwrap();
    assert_eq!(stale.generation, 0);
    drop(first);

    assert!(
        wait_until(Duration::from_secs(2), || !broker.is_owned("arm1")).await,
        "disconnect should reclaim arm1"
    );
    assert_eq!(broker.generation("arm1"), 1);

    let mut second = broker.client().await.unwrap();
    let current = second.acquire("arm1").await.unwrap();
    assert_eq!(current.generation, 1);

    // A third party replaying the old token is refused and changes nothing.
    let mut replay = broker.client().await.unwrap();
    let err = replay.release("arm1", &stale).await.unwrap_err();
    assert!(err.to_string().contains(CANNOT_TERMINATE));
    assert!(broker.is_owned("arm1"));
    assert_eq!(broker.generation("arm1"), 1);

    // Even the rightful owner can't use the stale generation.
    assert!(second.release("arm1", &stale).await.is_err());
    second.release("arm1", &current).await.unwrap();
    assert_eq!(broker.generation("arm1"), 2);
}

#[tokio::test]
async fn token_for_a_recreated_resource_is_rejected() {
    let broker = TestBroker::spawn(&["arm1"]).await.unwrap();
    let mut client = broker.client().await.unwrap();
    let old = client.acquire("arm1").await.unwrap();

    // The host rebuilds its resource table while the client still holds a token.
    broker.registry.reset();
    let fresh = client.acquire("arm1").await.unwrap();
    assert_ne!(fresh.identity, old.identity);
    assert_eq!(fresh.generation, 0);

    // Same generation number, wrong identity.
    let forged = FencingToken {
        identity: old.identity.clone(),
        generation: fresh.generation,
    };
    assert!(client.release("arm1", &forged).await.is_err());
    assert!(broker.is_owned("arm1"));
    client.release("arm1", &fresh).await.unwrap();
}

#[tokio::test]
async fn terminate_response_names_the_resource() {
    let broker = TestBroker::spawn(&["arm1"]).await.unwrap();
    let mut conn = RawConnection::connect(broker.addr).await.unwrap();

    conn.send(Request::ResourceOwnership {
        resource_name: "arm1".to_string(),
    })
    .await
    .unwrap();
    let token = match conn.next_response().await.unwrap() {
        Response::ResourceOwnership {
            outcome: Ok(token), ..
        } => token,
        other => panic!("expected a grant, got {other:?}"),
    };

    conn.send(Request::TerminateConnection {
        resource_name: "arm1".to_string(),
        token,
    })
    .await
    .unwrap();
    assert_eq!(
        conn.next_response().await.unwrap(),
        Response::TerminateConnection {
            resource_name: "arm1".to_string(),
            outcome: Ok(()),
        }
    );
}

#[tokio::test]
async fn release_of_unknown_resource_is_refused() {
    let broker = TestBroker::spawn(&["arm1"]).await.unwrap();
    let mut client = broker.client().await.unwrap();
    let token = client.acquire("arm1").await.unwrap();
    let err = client.release("wrist", &token).await.unwrap_err();
    assert!(err.to_string().contains(CANNOT_TERMINATE));
    assert!(broker.is_owned("arm1"));
}
