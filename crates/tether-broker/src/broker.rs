use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::manager::SessionManager;
use crate::registry::ResourceRegistry;
use crate::session::{self, Session, SessionEvent, SessionId};
use crate::writer::{self, WriteCommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tether::codec::ProtoCodec;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

/// Capacity of the channel feeding the session-management loop.
const EVENT_QUEUE: usize = 256;

/// State read by both the control surface and the loops.
pub(crate) struct BrokerShared {
    pub(crate) accepting: AtomicBool,
    pub(crate) sessions: AtomicUsize,
}

impl BrokerShared {
    pub(crate) fn new(accepting: bool) -> Self {
        Self {
            accepting: AtomicBool::new(accepting),
            sessions: AtomicUsize::new(0),
        }
    }
}

/// Handles for the three loops of a running broker.
struct Running {
    local_addr: SocketAddr,
    /// Stops the accept loop.
    shutdown: CancellationToken,
    /// Tells the management loop to close every session and exit.
    drain: CancellationToken,
    accept: JoinHandle<()>,
    manager: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Grants exclusive, fenced ownership of registry resources to TCP clients.
///
/// Constructed explicitly and driven through [`Broker::start`] and
/// [`Broker::stop`]; every method is safe to call from any task.
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<dyn ResourceRegistry>,
    shared: Arc<BrokerShared>,
    running: Mutex<Option<Running>>,
}

impl Broker {
    pub fn new(config: BrokerConfig, registry: Arc<dyn ResourceRegistry>) -> Self {
        let shared = Arc::new(BrokerShared::new(config.accept_on_start));
        Self {
            config,
            registry,
            shared,
            running: Mutex::new(None),
        }
    }

    /// Bind the listener and start the accept, session-management and writer
    /// loops. Returns the bound address; a no-op if already running.
    pub async fn start(&self) -> Result<SocketAddr, BrokerError> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.local_addr);
        }

        let listener = TcpListener::bind(self.config.listen)
            .await
            .map_err(|source| BrokerError::Bind {
                addr: self.config.listen,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        self.shared
            .accepting
            .store(self.config.accept_on_start, Ordering::SeqCst);
        self.shared.sessions.store(0, Ordering::SeqCst);

        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(EVENT_QUEUE);
        let (write_tx, write_rx) = mpsc::unbounded_channel::<WriteCommand>();
        let shutdown = CancellationToken::new();
        let drain = CancellationToken::new();

        // A peer that can't absorb one frame within a liveness window is as good as dead.
        let writer = tokio::spawn(writer::write_loop(
            write_rx,
            event_tx.clone(),
            self.config.liveness_window(),
        ));

        let manager = SessionManager::new(
            self.registry.clone(),
            self.shared.clone(),
            write_tx.clone(),
            self.config.liveness_window(),
        );
        let manager = tokio::spawn(manager.run(event_rx, self.config.sweep_interval(), drain.clone()));

        let accept = tokio::spawn(accept_loop(
            listener,
            event_tx,
            write_tx,
            self.config.max_frame_bytes,
            shutdown.clone(),
        ));

        tracing::info!(
            addr = %local_addr,
            liveness_ms = self.config.liveness_window_ms,
            accepting = self.config.accept_on_start,
            "broker listening"
        );

        *running = Some(Running {
            local_addr,
            shutdown,
            drain,
            accept,
            manager,
            writer,
        });
        Ok(local_addr)
    }

    /// Stop accepting, close every session (reclaiming its resources), flush
    /// outstanding writes, and wait for all three loops. Idempotent; a
    /// concurrent caller waits for the first to finish.
    pub async fn stop(&self) {
        // Held until every loop has joined, so `start` and other `stop`s queue behind it.
        let mut running = self.running.lock().await;
        let Some(r) = running.take() else {
            return;
        };
        tracing::info!(addr = %r.local_addr, "broker stopping");

        r.shutdown.cancel();
        if let Err(e) = r.accept.await {
            tracing::error!(err = %e, "accept loop panicked");
        }
        r.drain.cancel();
        if let Err(e) = r.manager.await {
            tracing::error!(err = %e, "session manager panicked");
        }
        if let Err(e) = r.writer.await {
            tracing::error!(err = %e, "writer loop panicked");
        }
        self.shared.sessions.store(0, Ordering::SeqCst);
        tracing::info!("broker stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Whether new ownership requests are granted. Existing sessions and
    /// heartbeats are unaffected by this flag.
    pub fn accepting_new_clients(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    pub fn set_accepting_new_clients(&self, accepting: bool) {
        let was = self.shared.accepting.swap(accepting, Ordering::SeqCst);
        if was != accepting {
            tracing::info!(accepting, "ownership intake changed");
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.load(Ordering::SeqCst)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        // Dropped without `stop`: let the loops wind down on their own.
        if let Ok(mut running) = self.running.try_lock()
            && let Some(r) = running.take()
        {
            r.shutdown.cancel();
            r.drain.cancel();
        }
    }
}

/// The accept loop: each connection becomes an active session with its first
/// read issued. Exits when `shutdown` fires, closing the listener.
async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<SessionEvent>,
    writes: mpsc::UnboundedSender<WriteCommand>,
    max_frame_bytes: usize,
    shutdown: CancellationToken,
) {
    let mut next_id: u64 = 1;
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(err = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let id = SessionId::from_raw(next_id);
        next_id += 1;
        stream.set_nodelay(true).ok();

        let mut session = Session::new(id, peer);
        let (read_half, write_half) = stream.into_split();
        let read_cancel = session.read_cancel();
        session.activate();

        let _ = writes.send(WriteCommand::Attach {
            session: id,
            sink: FramedWrite::new(write_half, ProtoCodec::new_with_max_length(max_frame_bytes)),
        });
        // The session must reach the manager before anything its reader reports.
        if events.send(SessionEvent::Opened(session)).await.is_err() {
            break;
        }
        tokio::spawn(session::read_loop(
            id,
            read_half,
            max_frame_bytes,
            events.clone(),
            read_cancel,
        ));
    }
    drop(listener);
    tracing::debug!("accept loop exited");
}
