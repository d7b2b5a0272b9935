use crate::session::{CloseReason, SessionEvent, SessionId};
use futures_util::SinkExt;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tether::codec::ProtoCodec;
use tether::protocol::Response;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::FramedWrite;

pub(crate) type SessionSink = FramedWrite<OwnedWriteHalf, ProtoCodec>;

pub(crate) enum WriteCommand {
    Attach { session: SessionId, sink: SessionSink },
    Send { session: SessionId, response: Response },
    /// Flush what is queued, then drop the sink (closing the socket's write side).
    Detach { session: SessionId },
}

/// Queued responses for one session. `sink` is `None` while a write is in flight.
struct Outbox {
    sink: Option<SessionSink>,
    queue: VecDeque<Response>,
    detached: bool,
}

type WriteOutcome = (SessionId, SessionSink, Result<(), String>);

/// The writer loop: keeps at most one write in flight per session, so a slow
/// peer only delays its own responses.
///
/// Runs until every command sender is gone and every pending write has finished.
pub(crate) async fn write_loop(
    mut commands: mpsc::UnboundedReceiver<WriteCommand>,
    events: mpsc::Sender<SessionEvent>,
    write_timeout: Duration,
) {
    let mut outboxes: HashMap<SessionId, Outbox> = HashMap::new();
    let mut pending: JoinSet<WriteOutcome> = JoinSet::new();
    let mut open = true;

    loop {
        tokio::select! {
            cmd = commands.recv(), if open => match cmd {
                Some(WriteCommand::Attach { session, sink }) => {
                    outboxes.insert(session, Outbox {
                        sink: Some(sink),
                        queue: VecDeque::new(),
                        detached: false,
                    });
                }
                Some(WriteCommand::Send { session, response }) => {
                    match outboxes.get_mut(&session) {
                        Some(outbox) if !outbox.detached => outbox.queue.push_back(response),
                        _ => tracing::debug!(session = %session, "dropping response for closed session"),
                    }
                    pump(&mut outboxes, &mut pending, session, write_timeout);
                }
                Some(WriteCommand::Detach { session }) => {
                    if let Some(outbox) = outboxes.get_mut(&session) {
                        outbox.detached = true;
                    }
                    pump(&mut outboxes, &mut pending, session, write_timeout);
                }
                None => open = false,
            },
            Some(done) = pending.join_next(), if !pending.is_empty() => {
                let (session, sink, result) = match done {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(err = %e, "write task failed");
                        continue;
                    }
                };
                match result {
                    Ok(()) => {
                        if let Some(outbox) = outboxes.get_mut(&session) {
                            outbox.sink = Some(sink);
                        }
                        pump(&mut outboxes, &mut pending, session, write_timeout);
                    }
                    Err(e) => {
                        outboxes.remove(&session);
                        tracing::debug!(session = %session, err = %e, "write failed");
                        // Must reach the manager or the session keeps its resources.
                        // Fails only once the manager has exited.
                        let _ = events
                            .send(SessionEvent::Closed {
                                session,
                                reason: CloseReason::TransportFailure(e),
                            })
                            .await;
                    }
                }
            }
            else => break,
        }

        if !open && pending.is_empty() {
            break;
        }
    }
    tracing::debug!("writer loop drained");
}

/// Start the next write for `session` if its sink is idle, or retire the
/// outbox once it is detached and empty.
fn pump(
    outboxes: &mut HashMap<SessionId, Outbox>,
    pending: &mut JoinSet<WriteOutcome>,
    session: SessionId,
    write_timeout: Duration,
) {
    let Some(outbox) = outboxes.get_mut(&session) else {
        return;
    };
    if outbox.sink.is_none() {
        return;
    }
    match outbox.queue.pop_front() {
        Some(response) => {
            let Some(mut sink) = outbox.sink.take() else {
                return;
            };
            pending.spawn(async move {
                let result = match tokio::time::timeout(write_timeout, sink.send(response)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("write stalled for {}ms", write_timeout.as_millis())),
                };
                (session, sink, result)
            });
        }
        None if outbox.detached => {
            outboxes.remove(&session);
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::FramedRead;

    async fn connected_pair() -> (SessionSink, FramedRead<TcpStream, ProtoCodec>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_, write) = server.into_split();
        (
            FramedWrite::new(write, ProtoCodec::new()),
            FramedRead::new(client, ProtoCodec::new()),
        )
    }

    #[tokio::test]
    async fn responses_arrive_in_order_and_detach_closes() {
        let (sink, mut client) = connected_pair().await;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::channel(8);
        let writer = tokio::spawn(write_loop(cmd_rx, event_tx, Duration::from_secs(5)));

        let id = SessionId::from_raw(1);
        cmd_tx.send(WriteCommand::Attach { session: id, sink }).unwrap();
        for confirm in [true, false, true] {
            cmd_tx
                .send(WriteCommand::Send {
                    session: id,
                    response: Response::Connection { confirm },
                })
                .unwrap();
        }
        cmd_tx.send(WriteCommand::Detach { session: id }).unwrap();

        let mut seen = Vec::new();
        while let Some(frame) = client.next().await {
            match Response::try_from(frame.unwrap()).unwrap() {
                Response::Connection { confirm } => seen.push(confirm),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec![true, false, true]);

        drop(cmd_tx);
        writer.await.unwrap();
    }

    /// A frame just under the default size limit.
    fn bulky_response() -> Response {
        Response::ResourceOwnership {
            resource_name: "x".repeat(60_000),
            outcome: Err(String::new()),
        }
    }

    /// Queue enough data for a peer that never reads to fill both socket buffers.
    fn flood(cmd_tx: &mpsc::UnboundedSender<WriteCommand>, session: SessionId) {
        for _ in 0..400 {
            cmd_tx
                .send(WriteCommand::Send {
                    session,
                    response: bulky_response(),
                })
                .unwrap();
        }
    }

    /// Wait for a transport failure report for `session`, skipping other events.
    async fn transport_failure(
        events: &mut mpsc::Receiver<SessionEvent>,
        session: SessionId,
    ) -> bool {
        let wait = async {
            while let Some(event) = events.recv().await {
                if let SessionEvent::Closed {
                    session: id,
                    reason: CloseReason::TransportFailure(_),
                } = event
                    && id == session
                {
                    return true;
                }
            }
            false
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn stalled_peer_is_reported_as_transport_failure() {
        // Keep the client half open but never read from it.
        let (sink, _client) = connected_pair().await;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let writer = tokio::spawn(write_loop(cmd_rx, event_tx, Duration::from_millis(200)));

        let id = SessionId::from_raw(1);
        cmd_tx.send(WriteCommand::Attach { session: id, sink }).unwrap();
        flood(&cmd_tx, id);

        assert!(transport_failure(&mut event_rx, id).await);

        drop(cmd_tx);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn failure_report_waits_for_room_in_a_full_queue() {
        let (sink, _client) = connected_pair().await;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::channel(1);
        event_tx
            .send(SessionEvent::Closed {
                session: SessionId::from_raw(99),
                reason: CloseReason::Disconnected,
            })
            .await
            .unwrap();
        let writer = tokio::spawn(write_loop(cmd_rx, event_tx, Duration::from_millis(200)));

        let id = SessionId::from_raw(1);
        cmd_tx.send(WriteCommand::Attach { session: id, sink }).unwrap();
        flood(&cmd_tx, id);

        // Let the write stall and time out while the queue is still full.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(transport_failure(&mut event_rx, id).await);

        drop(cmd_tx);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn responses_for_unknown_sessions_are_dropped() {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::channel(8);
        let writer = tokio::spawn(write_loop(cmd_rx, event_tx, Duration::from_secs(5)));
        cmd_tx
            .send(WriteCommand::Send {
                session: SessionId::from_raw(9),
                response: Response::Connection { confirm: true },
            })
            .unwrap();
        drop(cmd_tx);
        writer.await.unwrap();
    }
}
