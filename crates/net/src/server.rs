//! TCP listeners
//!
//! [`SignalingServer`] feeds decoded client events into the relay and
//! writes relay output back from a per-connection writer task.
//! [`ControlServer`] answers session management requests one at a time per
//! connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use livecourse_core::SessionLifecycle;

use crate::control::handle_request;
use crate::error::{Error, Result};
use crate::frame::{read_payload, write_frame};
use crate::protocol::{ClientEvent, ControlFailure, ControlRequest, ControlResponse, ServerEvent};
use crate::relay::SignalingRelay;

/// Accept connections until shutdown, spawning `handler` for each
async fn accept_loop<F, Fut>(
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
    handler: F,
) where
    F: Fn(TcpStream, SocketAddr, broadcast::Receiver<()>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handler(stream, addr, shutdown_tx.subscribe()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Signaling listener handle
pub struct SignalingServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl SignalingServer {
    pub async fn start(addr: SocketAddr, relay: Arc<SignalingRelay>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;
        info!(addr = %bound_addr, "Signaling server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            shutdown_tx.clone(),
            move |stream, addr, shutdown| {
                handle_signaling(stream, addr, relay.clone(), shutdown)
            },
        ));

        Ok(Self {
            addr: bound_addr,
            shutdown_tx,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and close every open connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Signaling server shutdown initiated");
    }
}

async fn handle_signaling(
    stream: TcpStream,
    addr: SocketAddr,
    relay: Arc<SignalingRelay>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, writer) = tokio::io::split(stream);
    let (conn, rx) = relay.register();
    info!(addr = %addr, connection = %conn, "Signaling peer connected");

    let writer_handle = tokio::spawn(writer_task(writer, rx));

    loop {
        tokio::select! {
            result = read_payload(&mut reader) => {
                match result {
                    Ok(payload) => match serde_json::from_slice::<ClientEvent>(&payload) {
                        Ok(event) => relay.dispatch(conn, event).await,
                        Err(e) => {
                            debug!(connection = %conn, error = %e, "Undecodable signaling frame");
                            relay.reject(conn, e.to_string());
                        }
                    },
                    Err(Error::ConnectionClosed) => {
                        debug!(connection = %conn, "Connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(connection = %conn, error = %e, "Read error");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(connection = %conn, "Closing connection for shutdown");
                break;
            }
        }
    }

    relay.disconnect(conn).await;
    // Dropping the sender lets the writer flush what is queued and exit
    if let Err(e) = writer_handle.await {
        debug!(connection = %conn, error = %e, "Writer task ended abnormally");
    }
    info!(addr = %addr, connection = %conn, "Signaling peer disconnected");
}

/// Writer task - sends relay output to the client
async fn writer_task(
    mut writer: WriteHalf<TcpStream>,
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &event).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Session management listener handle
pub struct ControlServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlServer {
    pub async fn start(addr: SocketAddr, lifecycle: Arc<SessionLifecycle>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;
        info!(addr = %bound_addr, "Control server started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(accept_loop(
            listener,
            shutdown_rx,
            shutdown_tx.clone(),
            move |stream, addr, shutdown| {
                handle_control(stream, addr, lifecycle.clone(), shutdown)
            },
        ));

        Ok(Self {
            addr: bound_addr,
            shutdown_tx,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Control server shutdown initiated");
    }
}

async fn handle_control(
    stream: TcpStream,
    addr: SocketAddr,
    lifecycle: Arc<SessionLifecycle>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    debug!(addr = %addr, "Control client connected");

    loop {
        let payload = tokio::select! {
            result = read_payload(&mut reader) => result,
            _ = shutdown_rx.recv() => break,
        };
        let response = match payload {
            Ok(payload) => match serde_json::from_slice::<ControlRequest>(&payload) {
                Ok(request) => handle_request(&lifecycle, request).await,
                Err(e) => ControlResponse::failed(ControlFailure {
                    kind: "invalid-input".into(),
                    message: format!("Invalid request: {}", e),
                    can_start_at: None,
                }),
            },
            Err(Error::ConnectionClosed) => break,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Control read error");
                break;
            }
        };
        if let Err(e) = write_frame(&mut writer, &response).await {
            debug!(addr = %addr, error = %e, "Control write failed");
            break;
        }
    }

    debug!(addr = %addr, "Control client disconnected");
}
