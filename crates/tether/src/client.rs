use crate::codec::ProtoCodec;
use crate::protocol::{FencingToken, LIVENESS_WINDOW, Request, Response};
use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Heartbeat period for [`BrokerClient::spawn_heartbeat`] that keeps a session
/// comfortably inside [`LIVENESS_WINDOW`].
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2_000);

type Writer = FramedWrite<OwnedWriteHalf, ProtoCodec>;

/// Client for the broker's TCP socket.
pub struct BrokerClient {
    reader: FramedRead<OwnedReadHalf, ProtoCodec>,
    writer: Arc<Mutex<Writer>>,
}

impl BrokerClient {
    /// Connect to a broker. No handshake is sent; see [`BrokerClient::handshake`].
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to broker")?;
        stream.set_nodelay(true).ok();
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(r, ProtoCodec::new()),
            writer: Arc::new(Mutex::new(FramedWrite::new(w, ProtoCodec::new()))),
        })
    }

    /// Send a request to the broker.
    pub async fn send(&mut self, req: Request) -> Result<()> {
        self.writer.lock().await.send(req).await?;
        Ok(())
    }

    /// Read the next response from the broker.
    pub async fn next_response(&mut self) -> Result<Response> {
        let Some(frame) = self.reader.next().await else {
            bail!("broker disconnected");
        };
        Ok(Response::try_from(frame?)?)
    }

    /// Send `ConnectionRequest`; returns whether the broker is granting ownership.
    pub async fn handshake(&mut self) -> Result<bool> {
        self.send(Request::Connection).await?;
        match self.next_response().await? {
            Response::Connection { confirm } => Ok(confirm),
            other => Err(anyhow!("expected connection response, got {other:?}")),
        }
    }

    /// Request exclusive ownership of `resource`. Refusals surface as errors
    /// carrying the broker's message.
    pub async fn acquire(&mut self, resource: &str) -> Result<FencingToken> {
        self.send(Request::ResourceOwnership {
            resource_name: resource.to_string(),
        })
        .await?;
        match self.next_response().await? {
            Response::ResourceOwnership {
                resource_name,
                outcome,
            } if resource_name == resource => outcome.map_err(|e| anyhow!("{e}")),
            other => Err(anyhow!("expected ownership response for {resource}, got {other:?}")),
        }
    }

    /// Release `resource` using the token handed out when it was acquired.
    pub async fn release(&mut self, resource: &str, token: &FencingToken) -> Result<()> {
        self.send(Request::TerminateConnection {
            resource_name: resource.to_string(),
            token: token.clone(),
        })
        .await?;
        match self.next_response().await? {
            Response::TerminateConnection {
                resource_name,
                outcome,
            } if resource_name == resource => outcome.map_err(|e| anyhow!("{e}")),
            other => Err(anyhow!("expected terminate response for {resource}, got {other:?}")),
        }
    }

    /// Send a single heartbeat.
    pub async fn heartbeat(&mut self) -> Result<()> {
        self.send(Request::Heartbeat).await
    }

    /// Keep the session alive from a background task until the handle is
    /// stopped or dropped.
    pub fn spawn_heartbeat(&self, interval: Duration) -> HeartbeatHandle {
        let writer = self.writer.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = writer.lock().await.send(Request::Heartbeat).await {
                    tracing::debug!(err = %e, "heartbeat failed, stopping");
                    break;
                }
            }
        });
        HeartbeatHandle { task }
    }
}

/// Background heartbeat task started by [`BrokerClient::spawn_heartbeat`].
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn stop(self) {
        // Drop aborts.
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
