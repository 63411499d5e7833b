//! Livecourse Network Library
//!
//! TCP front ends for the coordination core.
//!
//! # Architecture
//!
//! - **Relay**: routes signaling events between meeting participants
//! - **Servers**: signaling listener (relay) and control listener (session lifecycle)
//! - **Protocol**: JSON messages in length-prefixed frames
//!
//! # Usage
//!
//! ```ignore
//! let relay = Arc::new(SignalingRelay::new(rooms));
//! let signaling = SignalingServer::start(addr, relay).await?;
//!
//! let mut client = SignalingClient::connect(signaling.addr()).await?;
//! client.send(&ClientEvent::Ping {}).await?;
//! let pong = client.next_event().await?;
//! ```

pub mod client;
pub mod control;
pub mod error;
mod frame;
pub mod protocol;
pub mod relay;
pub mod server;

pub use client::{ControlClient, SignalingClient};
pub use error::{Error, Result};
pub use protocol::{ClientEvent, ControlRequest, ControlResponse, ServerEvent};
pub use relay::{RelayError, SignalingRelay};
pub use server::{ControlServer, SignalingServer};

/// Default signaling port
pub const DEFAULT_SIGNALING_PORT: u16 = 7331;

/// Default control port
pub const DEFAULT_CONTROL_PORT: u16 = 7332;
