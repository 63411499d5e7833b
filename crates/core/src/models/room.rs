//! Room model - the ephemeral meeting spawned by a live course

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::SessionId;
use crate::error::{Error, Result};

/// Six-digit numeric meeting code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    pub const LEN: usize = 6;

    /// Parse a client-supplied code, rejecting anything but six ASCII digits
    pub fn parse(code: &str) -> Result<Self> {
        if Self::is_valid(code) {
            Ok(Self(code.to_string()))
        } else {
            Err(Error::InvalidInput(format!(
                "meeting code must be {} digits, got {:?}",
                Self::LEN,
                code
            )))
        }
    }

    pub fn is_valid(code: &str) -> bool {
        code.len() == Self::LEN && code.bytes().all(|b| b.is_ascii_digit())
    }

    /// Draw a random code in 100000..=999999
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen_range(100_000u32..=999_999).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomCode {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-level connection identifier handed out by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Ended,
}

/// A participant registered in a room
#[derive(Debug, Clone)]
pub struct Participant {
    pub participant_id: String,
    pub display_name: String,
    pub is_host: bool,
    pub joined_at: DateTime<Utc>,
    pub connection: ConnectionId,
}

impl Participant {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.participant_id.clone(),
            participant_name: self.display_name.clone(),
            is_host: self.is_host,
            joined_at: self.joined_at,
        }
    }
}

/// Participant snapshot as shown to other peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub participant_name: String,
    pub is_host: bool,
    pub joined_at: DateTime<Utc>,
}

/// Read-only view of a room
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub code: RoomCode,
    pub session_id: SessionId,
    pub status: RoomStatus,
    pub host_id: String,
    pub host_name: String,
    pub router_id: String,
    pub participant_count: usize,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_validation() {
        assert!(RoomCode::parse("123456").is_ok());
        assert!(RoomCode::parse("12345").is_err());
        assert!(RoomCode::parse("1234567").is_err());
        assert!(RoomCode::parse("12a456").is_err());
        assert!(RoomCode::parse("١٢٣٤٥٦").is_err());
    }

    #[test]
    fn test_random_codes_are_six_digits() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let code = RoomCode::random(&mut rng);
            assert!(RoomCode::is_valid(code.as_str()), "bad code {}", code);
            assert_ne!(code.as_str().as_bytes()[0], b'0');
        }
    }

    #[test]
    fn test_code_deserialization_validates() {
        let ok: RoomCode = serde_json::from_str("\"654321\"").unwrap();
        assert_eq!(ok.as_str(), "654321");
        assert!(serde_json::from_str::<RoomCode>("\"abc\"").is_err());
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
    }
}
