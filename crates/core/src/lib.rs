//! Livecourse Core Library
//!
//! Course sessions, live rooms, recording coordination and storage for the
//! Livecourse server.

pub mod config;
pub mod error;
pub mod invariants;
pub mod lifecycle;
pub mod locks;
pub mod media;
pub mod models;
pub mod recording;
pub mod registry;
pub mod storage;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use config::{LifecycleConfig, MediaConfig, RecordingConfig};
pub use error::{DependencyError, Error, ErrorKind, InvalidState, RecorderError, Result, StoreError};
pub use lifecycle::{
    CourseJoin, Degradation, SessionLifecycle, SessionReport, StartOptions, TransitionOutcome,
};
pub use media::{LocalMediaRouter, MediaRouter, RouterHandle, TransportDescriptor};
pub use models::*;
pub use recording::{FfmpegRecorder, Recorder, RecordingCoordinator, RecordingMetadata};
pub use registry::{JoinOutcome, LeaveOutcome, Room, RoomRegistry};
pub use storage::{CourseStore, MemoryCourseStore, SessionFilter, SqliteCourseStore};
