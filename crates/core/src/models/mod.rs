//! Data models for live courses

mod recording;
mod room;
mod session;

pub use recording::*;
pub use room::*;
pub use session::*;
