use crate::fencing;
use crate::registry::ResourceRegistry;
use futures_util::StreamExt;
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tether::codec::{CodecError, ProtoCodec};
use tether::protocol::Request;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// Broker-assigned identifier of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session left `Active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection.
    Disconnected,
    /// Socket read or write failed.
    TransportFailure(String),
    /// Peer sent something that is not a request.
    ProtocolViolation(String),
    /// Nothing received within the liveness window.
    LivenessTimeout,
    /// Broker is stopping.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Disconnected => write!(f, "disconnected"),
            CloseReason::TransportFailure(e) => write!(f, "transport failure: {e}"),
            CloseReason::ProtocolViolation(e) => write!(f, "protocol violation: {e}"),
            CloseReason::LivenessTimeout => write!(f, "liveness timeout"),
            CloseReason::Shutdown => write!(f, "broker shutdown"),
        }
    }
}

/// What a session's reader (or the writer loop) reports to the management loop.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Opened(Session),
    Inbound { session: SessionId, request: Request },
    Closed { session: SessionId, reason: CloseReason },
}

/// Per-connection state owned by the session-management loop.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    state: SessionState,
    last_activity: Instant,
    owned: BTreeSet<String>,
    /// Stops the reader task; cancelled on close or drop.
    read_cancel: CancellationToken,
}

impl Session {
    pub fn new(id: SessionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Connecting,
            last_activity: Instant::now(),
            owned: BTreeSet::new(),
            read_cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn owned_resources(&self) -> impl Iterator<Item = &str> {
        self.owned.iter().map(String::as_str)
    }

    /// `Connecting → Active`. Starts the liveness clock.
    pub fn activate(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Active;
            self.last_activity = Instant::now();
        }
    }

    /// Credit a successfully parsed inbound message (heartbeats included).
    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Silent for longer than `window`, whatever the state of its read.
    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > window
    }

    pub(crate) fn record_acquired(&mut self, resource: &str) {
        self.owned.insert(resource.to_string());
    }

    pub(crate) fn record_released(&mut self, resource: &str) -> bool {
        self.owned.remove(resource)
    }

    /// `Active → Closing`. Returns false if the session was already closing
    /// or closed; closing is terminal.
    pub fn begin_close(&mut self) -> bool {
        match self.state {
            SessionState::Connecting | SessionState::Active => {
                self.state = SessionState::Closing;
                self.read_cancel.cancel();
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    /// `Closing → Closed`. Force-releases everything the session still holds
    /// and returns `(resource, new generation)` for each reclaimed resource.
    pub fn finish_close(&mut self, registry: &dyn ResourceRegistry) -> Vec<(String, u64)> {
        if self.state != SessionState::Closing {
            return Vec::new();
        }
        let released = std::mem::take(&mut self.owned)
            .into_iter()
            .filter_map(|name| {
                fencing::force_release(registry, &name, self.id).map(|generation| (name, generation))
            })
            .collect();
        self.state = SessionState::Closed;
        released
    }

    pub(crate) fn read_cancel(&self) -> CancellationToken {
        self.read_cancel.clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.read_cancel.cancel();
    }
}

/// Read frames off one connection and forward them, in arrival order, to the
/// management loop. Exits after reporting the first failure.
pub(crate) async fn read_loop(
    id: SessionId,
    read_half: OwnedReadHalf,
    max_frame_bytes: usize,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut reader = FramedRead::new(read_half, ProtoCodec::new_with_max_length(max_frame_bytes));
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = reader.next() => frame,
        };

        let event = match frame {
            Some(Ok(msg)) => match Request::try_from(msg) {
                Ok(request) => SessionEvent::Inbound {
                    session: id,
                    request,
                },
                Err(e) => SessionEvent::Closed {
                    session: id,
                    reason: CloseReason::ProtocolViolation(e.to_string()),
                },
            },
            Some(Err(CodecError::Io(e))) => SessionEvent::Closed {
                session: id,
                reason: CloseReason::TransportFailure(e.to_string()),
            },
            Some(Err(e)) => SessionEvent::Closed {
                session: id,
                reason: CloseReason::ProtocolViolation(e.to_string()),
            },
            None => SessionEvent::Closed {
                session: id,
                reason: CloseReason::Disconnected,
            },
        };

        let last = matches!(event, SessionEvent::Closed { .. });
        if events.send(event).await.is_err() || last {
            return;
        }
    }
}
