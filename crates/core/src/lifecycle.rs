//! Session lifecycle - the live course state machine
//!
//! ```text
//! Scheduled --start--> Active --pause--> Paused --start/resume--> Active
//!                        |                  |
//!                        +----complete------+--> Completed
//! ```
//!
//! Transitions are serialized per session id. Room creation and store
//! writes are fatal to a transition; recorder trouble is not, and is
//! reported as a [`Degradation`] on the successful outcome.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::LifecycleConfig;
use crate::error::{Error, ErrorKind, InvalidState, RecorderError, Result};
use crate::invariants::assert_session_invariants;
use crate::locks::KeyedLocks;
use crate::models::{
    NewSession, Recording, RoomSummary, Session, SessionId, SessionPatch, SessionStatus,
};
use crate::recording::{RecordingCoordinator, RecordingMetadata};
use crate::registry::RoomRegistry;
use crate::storage::{CourseStore, SessionFilter};

/// A dependency that misbehaved without failing the transition
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Degradation {
    pub operation: &'static str,
    pub message: String,
}

impl Degradation {
    fn recorder(operation: &'static str, err: &RecorderError) -> Self {
        Self {
            operation,
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DependencyDegraded
    }
}

/// Result of start, resume, pause and complete
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    pub session: Session,
    pub message: String,
    pub room: Option<RoomSummary>,
    /// A new room was created by this transition
    pub room_created: bool,
    /// Start found the course paused and resumed it instead
    pub resumed: bool,
    pub recording_active: bool,
    pub recording: Option<Recording>,
    pub degraded: Vec<Degradation>,
}

/// Result of registering a user with a course
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseJoin {
    pub session_id: SessionId,
    pub course_name: String,
    pub user_id: String,
    pub joined_at: Option<DateTime<Utc>>,
    pub total_joined_users: usize,
    pub course_status: SessionStatus,
    pub already_joined: bool,
}

/// Course, room and recording in one view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session: Session,
    pub room: Option<RoomSummary>,
    pub recording: Option<Recording>,
}

/// Per-call overrides for [`SessionLifecycle::start`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Skip the schedule gate
    pub force: bool,
}

pub struct SessionLifecycle {
    store: Arc<dyn CourseStore>,
    rooms: Arc<RoomRegistry>,
    recordings: Arc<RecordingCoordinator>,
    config: LifecycleConfig,
    locks: KeyedLocks<SessionId>,
}

impl SessionLifecycle {
    pub fn new(
        store: Arc<dyn CourseStore>,
        rooms: Arc<RoomRegistry>,
        recordings: Arc<RecordingCoordinator>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            rooms,
            recordings,
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub fn recordings(&self) -> &Arc<RecordingCoordinator> {
        &self.recordings
    }

    fn load(&self, id: &SessionId) -> Result<Session> {
        self.store
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("course {}", id)))
    }

    fn persist(&self, id: &SessionId, patch: SessionPatch) -> Result<Session> {
        let session = self.store.update(id, &patch)?;
        assert_session_invariants(&session);
        Ok(session)
    }

    fn metadata(session: &Session) -> RecordingMetadata {
        RecordingMetadata {
            course_name: session.name.clone(),
            instructor_id: session.instructor_id.clone(),
            instructor_name: session.instructor_name.clone(),
        }
    }

    /// Validate and store a new scheduled course
    pub fn create_session(&self, new: NewSession) -> Result<Session> {
        new.validate()?;
        let session = Session::from_new(new, Utc::now());
        self.store.create(&session)?;
        info!(
            session_id = %session.id,
            name = %session.name,
            scheduled_at = %session.scheduled_at,
            "Course created"
        );
        Ok(session)
    }

    pub fn get(&self, id: &SessionId) -> Result<Session> {
        self.load(id)
    }

    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        Ok(self.store.list(filter)?)
    }

    /// Course snapshot with its live room and latest recording
    ///
    /// `roomCode` is reported only while the registry still holds that room.
    /// A room ended from the signaling side leaves the stored code behind
    /// until the next transition.
    pub fn status(&self, id: &SessionId) -> Result<SessionReport> {
        let mut session = self.load(id)?;
        let room = self
            .rooms
            .get_room_info(id)
            .ok()
            .filter(|room| session.room_code.as_ref() == Some(&room.code));
        if room.is_none() && session.room_code.take().is_some() {
            debug!(session_id = %id, "Stored room is gone, omitting its code");
        }
        let recording = self
            .recordings
            .status(id)
            .or_else(|| session.recording.clone());
        Ok(SessionReport {
            session,
            room,
            recording,
        })
    }

    /// Start a scheduled course, or resume a paused one
    pub async fn start(&self, id: &SessionId, options: StartOptions) -> Result<TransitionOutcome> {
        let _guard = self.locks.lock(id).await;
        let session = self.load(id)?;

        match session.status {
            SessionStatus::Completed => return Err(InvalidState::AlreadyCompleted.into()),
            SessionStatus::Active => return Err(InvalidState::AlreadyActive.into()),
            SessionStatus::Paused => {
                let mut outcome = self.resume_locked(session).await?;
                outcome.resumed = true;
                return Ok(outcome);
            }
            SessionStatus::Scheduled => {}
        }

        let now = Utc::now();
        if self.config.enforce_schedule && !options.force {
            let earliest = session.earliest_start(self.config.start_lead());
            if now < earliest {
                info!(session_id = %id, %earliest, "Start rejected, too early");
                return Err(Error::TooEarly { earliest });
            }
        }

        let (code, room_created) = self
            .rooms
            .create_room(id, &session.instructor_name, &session.instructor_id)
            .await?;

        let mut degraded = Vec::new();
        let mut recording = None;
        if session.recording_enabled {
            match self.recordings.start(id, &Self::metadata(&session)).await {
                Ok(r) => recording = Some(r),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Recording unavailable, continuing without it");
                    degraded.push(Degradation::recorder("recording start", &e));
                }
            }
        }
        let recording_active = self.recordings.is_live(id);

        let patch = SessionPatch {
            status: Some(SessionStatus::Active),
            room_code: Some(Some(code.clone())),
            started_at: Some(now),
            host_left_at: Some(None),
            recording_active: Some(recording_active),
            recording: Some(recording.clone()),
            ..Default::default()
        };
        let session = match self.persist(id, patch) {
            Ok(session) => session,
            Err(e) => {
                error!(session_id = %id, error = %e, "Failed to persist start, rolling back");
                if recording.is_some() {
                    let _ = self.recordings.discard(id).await;
                }
                if room_created {
                    self.rooms.end_room(id).await;
                }
                return Err(e);
            }
        };

        info!(session_id = %id, code = %code, recording_active, "Course started");
        let message = if degraded.is_empty() {
            "Live course started successfully".to_string()
        } else {
            "Live course started without recording".to_string()
        };
        Ok(TransitionOutcome {
            room: self.rooms.get_room_info(id).ok(),
            session,
            message,
            room_created,
            resumed: false,
            recording_active,
            recording,
            degraded,
        })
    }

    /// Bring a paused course back to active
    pub async fn resume(&self, id: &SessionId) -> Result<TransitionOutcome> {
        let _guard = self.locks.lock(id).await;
        let session = self.load(id)?;
        match session.status {
            SessionStatus::Paused => self.resume_locked(session).await,
            SessionStatus::Active => Err(InvalidState::AlreadyActive.into()),
            SessionStatus::Completed => Err(InvalidState::AlreadyCompleted.into()),
            SessionStatus::Scheduled => Err(InvalidState::NotStarted.into()),
        }
    }

    async fn resume_locked(&self, session: Session) -> Result<TransitionOutcome> {
        let id = session.id.clone();
        let (code, room_created) = self
            .rooms
            .create_room(&id, &session.instructor_name, &session.instructor_id)
            .await?;

        let mut degraded = Vec::new();
        let mut recording = None;
        if session.recording_enabled {
            match self.recordings.resume(&id).await {
                Ok(r) => recording = Some(r),
                Err(RecorderError::NoActiveRecording(_)) => {
                    // Pausing discarded the previous recording
                    match self.recordings.start(&id, &Self::metadata(&session)).await {
                        Ok(r) => recording = Some(r),
                        Err(e) => {
                            warn!(session_id = %id, error = %e, "Could not restart recording");
                            degraded.push(Degradation::recorder("recording start", &e));
                        }
                    }
                }
                Err(RecorderError::WrongState { .. }) => {
                    recording = self.recordings.status(&id);
                }
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Could not resume recording");
                    degraded.push(Degradation::recorder("recording resume", &e));
                }
            }
        }
        let recording_active = self.recordings.is_live(&id);

        let mut patch = SessionPatch {
            status: Some(SessionStatus::Active),
            room_code: Some(Some(code.clone())),
            host_left_at: Some(None),
            host_rejoined_at: Some(Utc::now()),
            recording_active: Some(recording_active),
            ..Default::default()
        };
        if recording.is_some() {
            patch.recording = Some(recording.clone());
        }
        let session = match self.persist(&id, patch) {
            Ok(session) => session,
            Err(e) => {
                error!(session_id = %id, error = %e, "Failed to persist resume");
                if room_created {
                    self.rooms.end_room(&id).await;
                }
                return Err(e);
            }
        };

        info!(session_id = %id, code = %code, room_created, "Course resumed");
        Ok(TransitionOutcome {
            room: self.rooms.get_room_info(&id).ok(),
            session,
            message: "Host rejoined successfully. Course resumed.".to_string(),
            room_created,
            resumed: true,
            recording_active,
            recording,
            degraded,
        })
    }

    /// Host leaves temporarily; the recording so far is discarded
    pub async fn pause(&self, id: &SessionId) -> Result<TransitionOutcome> {
        let _guard = self.locks.lock(id).await;
        let session = self.load(id)?;
        if session.status != SessionStatus::Active {
            return Err(InvalidState::NotActive.into());
        }

        let mut degraded = Vec::new();
        let mut recording = None;
        if self.recordings.is_live(id) {
            match self.recordings.discard(id).await {
                Ok(r) => recording = Some(r),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Recording discard failed");
                    degraded.push(Degradation::recorder("recording discard", &e));
                    recording = self.recordings.status(id);
                }
            }
        }

        let mut patch = SessionPatch {
            status: Some(SessionStatus::Paused),
            host_left_at: Some(Some(Utc::now())),
            recording_active: Some(false),
            ..Default::default()
        };
        if recording.is_some() {
            patch.recording = Some(recording.clone());
        }
        let session = self.persist(id, patch)?;

        info!(session_id = %id, "Course paused, host left");
        Ok(TransitionOutcome {
            room: self.rooms.get_room_info(id).ok(),
            session,
            message: "Host left the live course successfully. Session paused.".to_string(),
            room_created: false,
            resumed: false,
            recording_active: false,
            recording,
            degraded,
        })
    }

    /// End the course for good
    pub async fn complete(&self, id: &SessionId) -> Result<TransitionOutcome> {
        let _guard = self.locks.lock(id).await;
        let session = self.load(id)?;
        match session.status {
            SessionStatus::Completed => return Err(InvalidState::AlreadyCompleted.into()),
            SessionStatus::Scheduled => return Err(InvalidState::NotStarted.into()),
            SessionStatus::Active | SessionStatus::Paused => {}
        }

        let room = self.rooms.end_room(id).await;

        let mut degraded = Vec::new();
        let recording = if self.recordings.is_live(id) {
            match self.recordings.stop(id).await {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Recording stop failed");
                    degraded.push(Degradation::recorder("recording stop", &e));
                    self.recordings.status(id)
                }
            }
        } else {
            self.recordings.status(id).or(session.recording)
        };

        let patch = SessionPatch {
            status: Some(SessionStatus::Completed),
            room_code: Some(None),
            completed_at: Some(Utc::now()),
            recording_active: Some(false),
            recording: Some(recording.clone()),
            ..Default::default()
        };
        let session = self.persist(id, patch)?;

        info!(
            session_id = %id,
            recorded = recording.as_ref().map(|r| r.file_name.as_str()).unwrap_or("none"),
            "Course completed"
        );
        Ok(TransitionOutcome {
            session,
            message: "Live course completed successfully".to_string(),
            room,
            room_created: false,
            resumed: false,
            recording_active: false,
            recording,
            degraded,
        })
    }

    /// Register a user as having joined the course
    pub async fn join(&self, id: &SessionId, user_id: &str) -> Result<CourseJoin> {
        if user_id.trim().is_empty() {
            return Err(Error::InvalidInput("userId is required".into()));
        }

        let _guard = self.locks.lock(id).await;
        let session = self.load(id)?;
        if session.status == SessionStatus::Completed {
            return Err(InvalidState::CourseCompleted.into());
        }

        if session.has_joined(user_id) {
            return Ok(CourseJoin {
                session_id: session.id.clone(),
                course_name: session.name.clone(),
                user_id: user_id.to_string(),
                joined_at: session.joined_at.get(user_id).copied(),
                total_joined_users: session.joined_user_ids.len(),
                course_status: session.status,
                already_joined: true,
            });
        }

        let now = Utc::now();
        let mut joined_user_ids = session.joined_user_ids.clone();
        joined_user_ids.push(user_id.to_string());
        let mut joined_at: BTreeMap<String, DateTime<Utc>> = session.joined_at.clone();
        joined_at.insert(user_id.to_string(), now);

        let session = self.persist(
            id,
            SessionPatch {
                joined_user_ids: Some(joined_user_ids),
                joined_at: Some(joined_at),
                ..Default::default()
            },
        )?;

        info!(session_id = %id, user_id, total = session.joined_user_ids.len(), "User joined course");
        Ok(CourseJoin {
            session_id: session.id.clone(),
            course_name: session.name.clone(),
            user_id: user_id.to_string(),
            joined_at: Some(now),
            total_joined_users: session.joined_user_ids.len(),
            course_status: session.status,
            already_joined: false,
        })
    }

    /// Finalize recordings and close rooms before the process exits
    ///
    /// Running courses are left paused so a later start resumes them.
    pub async fn shutdown(&self) {
        for room in self.rooms.active_rooms() {
            let id = room.session_id.clone();
            let _guard = self.locks.lock(&id).await;

            self.rooms.end_room(&id).await;
            let recording = if self.recordings.is_live(&id) {
                match self.recordings.stop(&id).await {
                    Ok(r) => Some(r),
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "Recording stop failed during shutdown");
                        self.recordings.status(&id)
                    }
                }
            } else {
                None
            };

            let active = matches!(
                self.store.get(&id),
                Ok(Some(Session {
                    status: SessionStatus::Active,
                    ..
                }))
            );
            let mut patch = SessionPatch {
                room_code: Some(None),
                recording_active: Some(false),
                ..Default::default()
            };
            if active {
                patch.status = Some(SessionStatus::Paused);
                patch.host_left_at = Some(Some(Utc::now()));
            }
            if recording.is_some() {
                patch.recording = Some(recording);
            }
            if let Err(e) = self.store.update(&id, &patch) {
                error!(session_id = %id, error = %e, "Failed to persist shutdown state");
            }
        }

        for (id, result) in self.recordings.stop_all().await {
            if let Err(e) = result {
                warn!(session_id = %id, error = %e, "Orphan recording stop failed");
            }
        }
        info!("Lifecycle shut down");
    }
}
