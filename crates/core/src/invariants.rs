//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use std::collections::HashSet;

use crate::models::{RoomCode, RoomStatus, Session, SessionStatus};
use crate::registry::Room;

/// Validate that a room's state is internally consistent
pub fn assert_room_invariants(room: &Room) {
    debug_assert!(
        RoomCode::is_valid(room.code().as_str()),
        "Room has malformed code {}",
        room.code()
    );

    match room.status() {
        RoomStatus::Active => {
            debug_assert!(
                room.router().is_some(),
                "Active room {} has no router",
                room.code()
            );
        }
        RoomStatus::Ended => {
            debug_assert!(
                room.router().is_none(),
                "Ended room {} still owns a router",
                room.code()
            );
            debug_assert!(
                room.participant_count() == 0,
                "Ended room {} still has {} participants",
                room.code(),
                room.participant_count()
            );
        }
    }
}

/// Validate that a session's persisted state is consistent
pub fn assert_session_invariants(session: &Session) {
    // Room code only while a room may exist
    debug_assert!(
        session.room_code.is_none() || session.status.may_hold_room(),
        "Session {} is {} but still references room {:?}",
        session.id,
        session.status,
        session.room_code
    );

    debug_assert!(
        session.status != SessionStatus::Completed || session.completed_at.is_some(),
        "Session {} is completed without completed_at",
        session.id
    );

    debug_assert!(
        !session.recording_active || session.recording_enabled,
        "Session {} records with recording disabled",
        session.id
    );

    let unique: HashSet<_> = session.joined_user_ids.iter().collect();
    debug_assert!(
        unique.len() == session.joined_user_ids.len(),
        "Session {} has duplicate joined users",
        session.id
    );
}
