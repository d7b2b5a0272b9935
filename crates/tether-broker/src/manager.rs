use crate::broker::BrokerShared;
use crate::fencing::{self, AcquireError};
use crate::registry::ResourceRegistry;
use crate::session::{CloseReason, Session, SessionEvent, SessionId};
use crate::writer::WriteCommand;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tether::protocol::{CANNOT_TERMINATE, RESOURCE_NOT_GIVEN, Request, Response};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// The session-management loop. Sole owner of the session set.
pub(crate) struct SessionManager {
    registry: Arc<dyn ResourceRegistry>,
    shared: Arc<BrokerShared>,
    sessions: HashMap<SessionId, Session>,
    writes: mpsc::UnboundedSender<WriteCommand>,
    liveness_window: Duration,
}

impl SessionManager {
    pub(crate) fn new(
        registry: Arc<dyn ResourceRegistry>,
        shared: Arc<BrokerShared>,
        writes: mpsc::UnboundedSender<WriteCommand>,
        liveness_window: Duration,
    ) -> Self {
        Self {
            registry,
            shared,
            sessions: HashMap::new(),
            writes,
            liveness_window,
        }
    }

    /// Service session events and evict silent sessions until `drain` fires;
    /// then close every session and return.
    pub(crate) async fn run(
        mut self,
        mut events: mpsc::Receiver<SessionEvent>,
        sweep_interval: Duration,
        drain: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = drain.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sweep.tick() => self.evict_expired(Instant::now()),
            }
        }

        // Anything already queued is answered before the sessions go away.
        while let Ok(event) = events.try_recv() {
            self.handle(event);
        }
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close(id, CloseReason::Shutdown);
        }
        tracing::debug!("session manager drained");
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened(session) => {
                tracing::info!(session = %session.id(), peer = %session.peer(), "session opened");
                self.sessions.insert(session.id(), session);
                self.publish_count();
            }
            SessionEvent::Inbound { session, request } => self.dispatch(session, request),
            SessionEvent::Closed { session, reason } => self.close(session, reason),
        }
    }

    fn dispatch(&mut self, id: SessionId, request: Request) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if !session.is_active() {
            return;
        }
        session.touch(Instant::now());

        let accepting = self.shared.accepting.load(Ordering::SeqCst);
        let response = match request {
            Request::Connection => Some(Response::Connection { confirm: accepting }),
            Request::ResourceOwnership { resource_name } => {
                let granted = if accepting {
                    fencing::try_acquire(self.registry.as_ref(), &resource_name, id)
                } else {
                    Err(AcquireError::NotAccepting)
                };
                let outcome = match granted {
                    Ok(token) => {
                        session.record_acquired(&resource_name);
                        tracing::info!(
                            session = %id,
                            resource = %resource_name,
                            generation = token.generation,
                            "ownership granted"
                        );
                        Ok(token)
                    }
                    Err(e) => {
                        tracing::debug!(session = %id, resource = %resource_name, reason = %e, "ownership refused");
                        Err(RESOURCE_NOT_GIVEN.to_string())
                    }
                };
                Some(Response::ResourceOwnership {
                    resource_name,
                    outcome,
                })
            }
            Request::TerminateConnection {
                resource_name,
                token,
            } => {
                let outcome =
                    match fencing::try_release(self.registry.as_ref(), &resource_name, &token, id) {
                        Ok(generation) => {
                            session.record_released(&resource_name);
                            tracing::info!(
                                session = %id,
                                resource = %resource_name,
                                generation,
                                "ownership released"
                            );
                            Ok(())
                        }
                        Err(e) => {
                            tracing::debug!(session = %id, resource = %resource_name, reason = %e, "release refused");
                            Err(CANNOT_TERMINATE.to_string())
                        }
                    };
                Some(Response::TerminateConnection {
                    resource_name,
                    outcome,
                })
            }
            Request::Heartbeat => None,
        };

        if let Some(response) = response {
            let _ = self.writes.send(WriteCommand::Send {
                session: id,
                response,
            });
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_expired(now, self.liveness_window))
            .map(Session::id)
            .collect();
        for id in expired {
            self.close(id, CloseReason::LivenessTimeout);
        }
    }

    /// `Closing → Closed`: reclaim resources, close the transport, forget the
    /// session. Unknown ids are ignored, so repeated close reports are harmless.
    fn close(&mut self, id: SessionId, reason: CloseReason) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        session.begin_close();
        let released = session.finish_close(self.registry.as_ref());
        let _ = self.writes.send(WriteCommand::Detach { session: id });

        match reason {
            CloseReason::Disconnected | CloseReason::Shutdown => {
                tracing::info!(session = %id, reason = %reason, released = released.len(), "session closed");
            }
            _ => {
                tracing::warn!(session = %id, reason = %reason, released = released.len(), "session closed");
            }
        }
        for (resource, generation) in released {
            tracing::info!(session = %id, resource = %resource, generation, "ownership reclaimed");
        }
        self.publish_count();
    }

    fn publish_count(&self) {
        self.shared
            .sessions
            .store(self.sessions.len(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;

    struct Harness {
        manager: SessionManager,
        registry: Arc<InMemoryRegistry>,
        shared: Arc<BrokerShared>,
        writes: mpsc::UnboundedReceiver<WriteCommand>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(InMemoryRegistry::with_resources(["arm1"]));
        let shared = Arc::new(BrokerShared::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(
            registry.clone(),
            shared.clone(),
            tx,
            Duration::from_millis(7_000),
        );
        Harness {
            manager,
            registry,
            shared,
            writes: rx,
        }
    }

    fn open(h: &mut Harness, n: u64) -> SessionId {
        let id = SessionId::from_raw(n);
        let mut session = Session::new(id, "127.0.0.1:40000".parse().unwrap());
        session.activate();
        h.manager.handle(SessionEvent::Opened(session));
        id
    }

    fn next_response(h: &mut Harness) -> Response {
        loop {
            match h.writes.try_recv().expect("a queued write") {
                WriteCommand::Send { response, .. } => return response,
                WriteCommand::Attach { .. } | WriteCommand::Detach { .. } => continue,
            }
        }
    }

    fn request(h: &mut Harness, id: SessionId, request: Request) -> Response {
        h.manager.handle(SessionEvent::Inbound {
            session: id,
            request,
        });
        next_response(h)
    }

    #[test]
    fn connection_request_reports_accept_state() {
        let mut h = harness();
        let id = open(&mut h, 1);
        assert_eq!(
            request(&mut h, id, Request::Connection),
            Response::Connection { confirm: true }
        );
        h.shared.accepting.store(false, Ordering::SeqCst);
        assert_eq!(
            request(&mut h, id, Request::Connection),
            Response::Connection { confirm: false }
        );
    }

    #[test]
    fn heartbeat_is_not_answered() {
        let mut h = harness();
        let id = open(&mut h, 1);
        h.manager.handle(SessionEvent::Inbound {
            session: id,
            request: Request::Heartbeat,
        });
        assert!(h.writes.try_recv().is_err());
    }

    #[test]
    fn drain_mode_refuses_new_ownership() {
        let mut h = harness();
        let id = open(&mut h, 1);
        h.shared.accepting.store(false, Ordering::SeqCst);
        let resp = request(
            &mut h,
            id,
            Request::ResourceOwnership {
                resource_name: "arm1".to_string(),
            },
        );
        assert_eq!(
            resp,
            Response::ResourceOwnership {
                resource_name: "arm1".to_string(),
                outcome: Err(RESOURCE_NOT_GIVEN.to_string()),
            }
        );
        assert!(h.registry.lookup("arm1").unwrap().ownership().owner.is_none());
    }

    #[test]
    fn close_reclaims_and_is_idempotent() {
        let mut h = harness();
        let id = open(&mut h, 1);
        let resp = request(
            &mut h,
            id,
            Request::ResourceOwnership {
                resource_name: "arm1".to_string(),
            },
        );
        assert!(matches!(
            resp,
            Response::ResourceOwnership { outcome: Ok(_), .. }
        ));
        assert_eq!(h.shared.sessions.load(Ordering::SeqCst), 1);

        for _ in 0..2 {
            h.manager.handle(SessionEvent::Closed {
                session: id,
                reason: CloseReason::Disconnected,
            });
        }
        let ownership = h.registry.lookup("arm1").unwrap().ownership();
        assert!(ownership.owner.is_none());
        assert_eq!(ownership.generation, 1);
        assert_eq!(h.shared.sessions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transport_failure_reclaims_resources() {
        let mut h = harness();
        let id = open(&mut h, 1);
        request(
            &mut h,
            id,
            Request::ResourceOwnership {
                resource_name: "arm1".to_string(),
            },
        );

        // What the writer reports when a peer stops draining its socket.
        h.manager.handle(SessionEvent::Closed {
            session: id,
            reason: CloseReason::TransportFailure("write stalled for 7000ms".to_string()),
        });

        let ownership = h.registry.lookup("arm1").unwrap().ownership();
        assert!(ownership.owner.is_none());
        assert_eq!(ownership.generation, 1);
        assert!(!h.manager.sessions.contains_key(&id));
        assert!(matches!(
            h.writes.try_recv(),
            Ok(WriteCommand::Detach { session }) if session == id
        ));
    }

    #[test]
    fn requests_after_close_are_ignored() {
        let mut h = harness();
        let id = open(&mut h, 1);
        h.manager.handle(SessionEvent::Closed {
            session: id,
            reason: CloseReason::ProtocolViolation("bad frame".to_string()),
        });
        while h.writes.try_recv().is_ok() {}
        h.manager.handle(SessionEvent::Inbound {
            session: id,
            request: Request::Connection,
        });
        assert!(h.writes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_sessions_are_evicted() {
        let mut h = harness();
        let quiet = open(&mut h, 1);
        let chatty = open(&mut h, 2);
        request(
            &mut h,
            quiet,
            Request::ResourceOwnership {
                resource_name: "arm1".to_string(),
            },
        );

        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(3_000)).await;
            h.manager.handle(SessionEvent::Inbound {
                session: chatty,
                request: Request::Heartbeat,
            });
            h.manager.evict_expired(Instant::now());
        }

        assert!(!h.manager.sessions.contains_key(&quiet));
        assert!(h.manager.sessions.contains_key(&chatty));
        assert!(h.registry.lookup("arm1").unwrap().ownership().owner.is_none());
    }
}
