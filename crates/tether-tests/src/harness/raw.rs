use anyhow::{Result, bail};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tether::codec::ProtoCodec;
use tether::proto::ConnectionMessage;
use tether::protocol::Response;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// A connection that can put arbitrary bytes or frames on the wire.
pub struct RawConnection {
    framed: Framed<TcpStream, ProtoCodec>,
}

impl RawConnection {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(stream, ProtoCodec::new()),
        })
    }

    /// Send any frame, including ones a well-behaved client never sends.
    pub async fn send<T: Into<ConnectionMessage>>(&mut self, msg: T) -> Result<()> {
        let msg: ConnectionMessage = msg.into();
        self.framed.send(msg).await?;
        Ok(())
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.framed.get_mut().write_all(bytes).await?;
        Ok(())
    }

    pub async fn next_response(&mut self) -> Result<Response> {
        let Some(frame) = self.framed.next().await else {
            bail!("broker disconnected");
        };
        Ok(Response::try_from(frame?)?)
    }

    /// Wait for the broker to close the connection. Returns false on timeout.
    pub async fn closed_by_broker(&mut self, timeout: Duration) -> bool {
        let stream = self.framed.get_mut();
        let mut buf = [0u8; 256];
        let read = async {
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
        };
        tokio::time::timeout(timeout, read).await.is_ok()
    }
}
