//! Recording coordination
//!
//! [`RecordingCoordinator`] owns the per-session [`Recording`] records and
//! drives a [`Recorder`] backend. A session has at most one live
//! (recording or paused) recording; finished ones are kept for status
//! queries until the next recording starts.

mod ffmpeg;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RecorderError;
use crate::models::{Recording, RecordingStatus, SessionId};

pub use ffmpeg::FfmpegRecorder;

/// Descriptive data handed to the recorder when a recording starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub course_name: String,
    pub instructor_id: String,
    pub instructor_name: String,
}

/// Output of a finished recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingArtifact {
    pub duration_seconds: u64,
    pub size_bytes: u64,
    pub url: String,
}

/// Encoding backend
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Begin recording; returns the output file name
    async fn start(
        &self,
        session_id: &SessionId,
        metadata: &RecordingMetadata,
    ) -> Result<String, RecorderError>;

    async fn pause(&self, session_id: &SessionId) -> Result<(), RecorderError>;

    async fn resume(&self, session_id: &SessionId) -> Result<(), RecorderError>;

    /// Finalize the file
    async fn stop(&self, session_id: &SessionId) -> Result<RecordingArtifact, RecorderError>;

    /// Drop everything recorded so far
    async fn discard(&self, session_id: &SessionId) -> Result<(), RecorderError>;
}

#[derive(Default)]
struct Recordings {
    live: HashMap<SessionId, Recording>,
    finished: HashMap<SessionId, Recording>,
}

/// Tracks recordings and forwards commands to the backend
pub struct RecordingCoordinator {
    recorder: Arc<dyn Recorder>,
    timeout: Duration,
    recordings: Mutex<Recordings>,
}

impl RecordingCoordinator {
    pub fn new(recorder: Arc<dyn Recorder>, timeout: Duration) -> Self {
        Self {
            recorder,
            timeout,
            recordings: Mutex::new(Recordings::default()),
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, RecorderError>>,
    ) -> Result<T, RecorderError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RecorderError::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }

    fn live_status(&self, session_id: &SessionId) -> Option<RecordingStatus> {
        self.recordings
            .lock()
            .live
            .get(session_id)
            .map(|r| r.status)
    }

    pub async fn start(
        &self,
        session_id: &SessionId,
        metadata: &RecordingMetadata,
    ) -> Result<Recording, RecorderError> {
        if self.live_status(session_id).is_some() {
            return Err(RecorderError::AlreadyRecording(session_id.to_string()));
        }

        let file_name = self
            .bounded("recording start", self.recorder.start(session_id, metadata))
            .await?;
        let recording = Recording::started(session_id.clone(), file_name, Utc::now());

        let mut recordings = self.recordings.lock();
        recordings.finished.remove(session_id);
        recordings
            .live
            .insert(session_id.clone(), recording.clone());

        info!(session_id = %session_id, file = %recording.file_name, "Recording started");
        Ok(recording)
    }

    pub async fn pause(&self, session_id: &SessionId) -> Result<Recording, RecorderError> {
        self.expect_status(session_id, RecordingStatus::Recording)?;
        self.bounded("recording pause", self.recorder.pause(session_id))
            .await?;
        self.set_status(session_id, RecordingStatus::Paused)
    }

    pub async fn resume(&self, session_id: &SessionId) -> Result<Recording, RecorderError> {
        self.expect_status(session_id, RecordingStatus::Paused)?;
        self.bounded("recording resume", self.recorder.resume(session_id))
            .await?;
        self.set_status(session_id, RecordingStatus::Recording)
    }

    /// Finalize the live recording
    ///
    /// The live entry is released even when the backend fails, so a new
    /// recording can start afterwards.
    pub async fn stop(&self, session_id: &SessionId) -> Result<Recording, RecorderError> {
        if self.live_status(session_id).is_none() {
            return Err(RecorderError::NoActiveRecording(session_id.to_string()));
        }

        let result = self
            .bounded("recording stop", self.recorder.stop(session_id))
            .await;

        let mut recordings = self.recordings.lock();
        let mut recording = recordings
            .live
            .remove(session_id)
            .ok_or_else(|| RecorderError::NoActiveRecording(session_id.to_string()))?;
        recording.ended_at = Some(Utc::now());

        match result {
            Ok(artifact) => {
                recording.status = RecordingStatus::Completed;
                recording.duration_seconds = Some(artifact.duration_seconds);
                recording.size_bytes = Some(artifact.size_bytes);
                recording.url = Some(artifact.url);
                recordings
                    .finished
                    .insert(session_id.clone(), recording.clone());
                info!(
                    session_id = %session_id,
                    duration_seconds = artifact.duration_seconds,
                    size_bytes = artifact.size_bytes,
                    "Recording completed"
                );
                Ok(recording)
            }
            Err(e @ RecorderError::Timeout { .. }) => {
                recording.status = RecordingStatus::Unknown;
                recordings.finished.insert(session_id.clone(), recording);
                warn!(session_id = %session_id, error = %e, "Recording stop outcome unknown");
                Err(e)
            }
            Err(e) => {
                recording.status = RecordingStatus::Discarded;
                recordings.finished.insert(session_id.clone(), recording);
                warn!(session_id = %session_id, error = %e, "Recording stop failed");
                Err(e)
            }
        }
    }

    /// Throw the live recording away
    pub async fn discard(&self, session_id: &SessionId) -> Result<Recording, RecorderError> {
        if self.live_status(session_id).is_none() {
            return Err(RecorderError::NoActiveRecording(session_id.to_string()));
        }

        let result = self
            .bounded("recording discard", self.recorder.discard(session_id))
            .await;

        let mut recordings = self.recordings.lock();
        let mut recording = recordings
            .live
            .remove(session_id)
            .ok_or_else(|| RecorderError::NoActiveRecording(session_id.to_string()))?;
        recording.status = RecordingStatus::Discarded;
        recording.ended_at = Some(Utc::now());
        recordings
            .finished
            .insert(session_id.clone(), recording.clone());

        match result {
            Ok(()) => {
                info!(session_id = %session_id, "Recording discarded");
                Ok(recording)
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Recording discard failed");
                Err(e)
            }
        }
    }

    /// Live recording, or the last finished one
    pub fn status(&self, session_id: &SessionId) -> Option<Recording> {
        let recordings = self.recordings.lock();
        recordings
            .live
            .get(session_id)
            .or_else(|| recordings.finished.get(session_id))
            .cloned()
    }

    pub fn is_live(&self, session_id: &SessionId) -> bool {
        self.live_status(session_id).is_some()
    }

    pub fn live_sessions(&self) -> Vec<SessionId> {
        self.recordings.lock().live.keys().cloned().collect()
    }

    /// Finalize every live recording, for shutdown
    pub async fn stop_all(&self) -> Vec<(SessionId, Result<Recording, RecorderError>)> {
        let mut results = Vec::new();
        for session_id in self.live_sessions() {
            let result = self.stop(&session_id).await;
            results.push((session_id, result));
        }
        results
    }

    fn expect_status(
        &self,
        session_id: &SessionId,
        expected: RecordingStatus,
    ) -> Result<(), RecorderError> {
        match self.live_status(session_id) {
            None => Err(RecorderError::NoActiveRecording(session_id.to_string())),
            Some(actual) if actual != expected => Err(RecorderError::WrongState {
                expected: expected.as_str(),
                actual: actual.as_str(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn set_status(
        &self,
        session_id: &SessionId,
        status: RecordingStatus,
    ) -> Result<Recording, RecorderError> {
        let mut recordings = self.recordings.lock();
        let recording = recordings
            .live
            .get_mut(session_id)
            .ok_or_else(|| RecorderError::NoActiveRecording(session_id.to_string()))?;
        recording.status = status;
        info!(session_id = %session_id, status = status.as_str(), "Recording state changed");
        Ok(recording.clone())
    }
}
