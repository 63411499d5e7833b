//! Session model - a scheduled live course

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Recording, RoomCode};
use crate::error::{Error, Result};

/// Default course length when none is given
pub const DEFAULT_DURATION_MINUTES: u32 = 60;

/// Opaque, externally assigned session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an id of the form `course_<unix millis>_<9 alphanumerics>`
    pub fn generate() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(9)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        Self(format!("course_{}_{}", Utc::now().timestamp_millis(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Scheduled,
    Active,
    Paused,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(SessionStatus::Scheduled),
            "active" => Some(SessionStatus::Active),
            "paused" => Some(SessionStatus::Paused),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }

    /// Whether a room may be linked to a session in this state
    pub fn may_hold_room(self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Paused)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live course
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub instructor_id: String,
    pub instructor_name: String,
    pub duration_minutes: u32,
    pub status: SessionStatus,
    pub scheduled_at: DateTime<Utc>,
    pub recording_enabled: bool,
    pub room_code: Option<RoomCode>,
    #[serde(default)]
    pub enrolled_user_ids: Vec<String>,
    #[serde(default)]
    pub joined_user_ids: Vec<String>,
    #[serde(default)]
    pub joined_at: BTreeMap<String, DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub host_left_at: Option<DateTime<Utc>>,
    pub host_rejoined_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recording_active: bool,
    pub recording: Option<Recording>,
}

impl Session {
    /// Build a scheduled session from a creation request
    pub fn from_new(new: NewSession, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id.unwrap_or_else(SessionId::generate),
            name: new.name,
            description: new.description.unwrap_or_default(),
            category: new.category,
            instructor_id: new.instructor_id,
            instructor_name: new.instructor_name,
            duration_minutes: new.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES),
            status: SessionStatus::Scheduled,
            scheduled_at: new.scheduled_at.unwrap_or(now),
            recording_enabled: new.recording_enabled.unwrap_or(true),
            room_code: None,
            enrolled_user_ids: new.enrolled_user_ids,
            joined_user_ids: Vec::new(),
            joined_at: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            host_left_at: None,
            host_rejoined_at: None,
            completed_at: None,
            recording_active: false,
            recording: None,
        }
    }

    pub fn has_joined(&self, user_id: &str) -> bool {
        self.joined_user_ids.iter().any(|u| u == user_id)
    }

    /// Earliest instant at which the course may be started
    pub fn earliest_start(&self, lead: Duration) -> DateTime<Utc> {
        self.scheduled_at - lead
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, patch: &SessionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(room_code) = &patch.room_code {
            self.room_code = room_code.clone();
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = Some(started_at);
        }
        if let Some(host_left_at) = patch.host_left_at {
            self.host_left_at = host_left_at;
        }
        if let Some(host_rejoined_at) = patch.host_rejoined_at {
            self.host_rejoined_at = Some(host_rejoined_at);
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(recording_active) = patch.recording_active {
            self.recording_active = recording_active;
        }
        if let Some(recording) = &patch.recording {
            self.recording = recording.clone();
        }
        if let Some(joined) = &patch.joined_user_ids {
            self.joined_user_ids = joined.clone();
        }
        if let Some(joined_at) = &patch.joined_at {
            self.joined_at = joined_at.clone();
        }
        self.updated_at = patch.updated_at.unwrap_or_else(Utc::now);
    }
}

/// Partial update of the persisted session fields
///
/// `Option<Option<T>>` fields distinguish "leave unchanged" (`None`) from
/// "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub room_code: Option<Option<RoomCode>>,
    pub started_at: Option<DateTime<Utc>>,
    pub host_left_at: Option<Option<DateTime<Utc>>>,
    pub host_rejoined_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub recording_active: Option<bool>,
    pub recording: Option<Option<Recording>>,
    pub joined_user_ids: Option<Vec<String>>,
    pub joined_at: Option<BTreeMap<String, DateTime<Utc>>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Request to create a live course
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    #[serde(default)]
    pub id: Option<SessionId>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub instructor_id: String,
    #[serde(default)]
    pub instructor_name: String,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recording_enabled: Option<bool>,
    #[serde(default)]
    pub enrolled_user_ids: Vec<String>,
}

impl NewSession {
    /// Check required fields
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.instructor_id.trim().is_empty() {
            missing.push("instructorId");
        }
        if self.instructor_name.trim().is_empty() {
            missing.push("instructorName");
        }
        if self.category.trim().is_empty() {
            missing.push("category");
        }
        if !missing.is_empty() {
            return Err(Error::InvalidInput(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }
        if self.duration_minutes == Some(0) {
            return Err(Error::InvalidInput("duration must be positive".into()));
        }
        if let Some(id) = &self.id {
            if id.as_str().trim().is_empty() {
                return Err(Error::InvalidInput("session id must not be empty".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> NewSession {
        NewSession {
            name: "Beauty Basics Course".into(),
            category: "beauty".into(),
            instructor_id: "instructor_456".into(),
            instructor_name: "Jane Doe".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_generated_id_shape() {
        let id = SessionId::generate();
        let parts: Vec<_> = id.as_str().split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "course");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
    }

    #[test]
    fn test_from_new_defaults() {
        let now = Utc::now();
        let session = Session::from_new(new_session(), now);
        assert_eq!(session.status, SessionStatus::Scheduled);
        assert_eq!(session.scheduled_at, now);
        assert!(session.recording_enabled);
        assert_eq!(session.duration_minutes, DEFAULT_DURATION_MINUTES);
        assert!(session.room_code.is_none());
    }

    #[test]
    fn test_validate_reports_missing_fields() {
        let mut new = new_session();
        new.name = "  ".into();
        new.category.clear();
        let err = new.validate().unwrap_err().to_string();
        assert!(err.contains("name"));
        assert!(err.contains("category"));
        assert!(!err.contains("instructorId"));
    }

    #[test]
    fn test_patch_clears_optional_fields() {
        let mut session = Session::from_new(new_session(), Utc::now());
        session.room_code = Some(RoomCode::parse("123456").unwrap());
        session.host_left_at = Some(Utc::now());

        session.apply(&SessionPatch {
            room_code: Some(None),
            host_left_at: Some(None),
            ..Default::default()
        });

        assert!(session.room_code.is_none());
        assert!(session.host_left_at.is_none());
        assert_eq!(session.status, SessionStatus::Scheduled);
    }

    #[test]
    fn test_camel_case_wire_names() {
        let session = Session::from_new(new_session(), Utc::now());
        let json = serde_json::to_value(&session).unwrap();
        assert!(json.get("scheduledAt").is_some());
        assert!(json.get("joinedUserIds").is_some());
        assert_eq!(json["status"], "scheduled");
    }
}
