//! TCP clients for the signaling and control listeners

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{ClientEvent, ControlRequest, ControlResponse, ServerEvent};

/// How long [`SignalingClient::next_event`] waits before giving up
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Signaling connection
pub struct SignalingClient {
    reader: ReadHalf<TcpStream>,
    writer: WriteHalf<TcpStream>,
}

impl SignalingClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = tokio::io::split(stream);
        debug!(addr = %addr, "Signaling client connected");
        Ok(Self { reader, writer })
    }

    pub async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        write_frame(&mut self.writer, event).await
    }

    /// Wait for the next event from the server
    pub async fn next_event(&mut self) -> Result<ServerEvent> {
        tokio::time::timeout(EVENT_TIMEOUT, read_frame(&mut self.reader))
            .await
            .map_err(|_| Error::Timeout("server event"))?
    }

    /// Skip events until one matches `pred`
    pub async fn wait_for(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> Result<ServerEvent> {
        loop {
            let event = self.next_event().await?;
            if pred(&event) {
                return Ok(event);
            }
        }
    }
}

/// Session management connection
pub struct ControlClient {
    reader: ReadHalf<TcpStream>,
    writer: WriteHalf<TcpStream>,
}

impl ControlClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self { reader, writer })
    }

    pub async fn request(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        write_frame(&mut self.writer, request).await?;
        tokio::time::timeout(EVENT_TIMEOUT, read_frame(&mut self.reader))
            .await
            .map_err(|_| Error::Timeout("control response"))?
    }
}
