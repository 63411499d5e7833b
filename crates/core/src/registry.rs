//! Room registry - authoritative in-memory store of live meeting rooms
//!
//! Each room sits behind its own mutex so mutations of one room are
//! linearizable while different rooms proceed in parallel. The index that
//! maps codes and sessions to rooms is only held for lookups and inserts.
//!
//! Lock order: index, then room. Code running under a room lock (see
//! [`RoomRegistry::with_room`]) must not call back into the registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{DependencyError, Error, Result};
use crate::invariants::assert_room_invariants;
use crate::locks::KeyedLocks;
use crate::media::{MediaRouter, RouterHandle, TransportDescriptor};
use crate::models::{
    ConnectionId, Participant, ParticipantInfo, RoomCode, RoomStatus, RoomSummary, SessionId,
};

/// Result of adding a participant to a room
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Other participants as they were before this join
    pub existing: Vec<ParticipantInfo>,
    pub participant: ParticipantInfo,
    /// The participant was already present; their entry was refreshed
    pub rejoined: bool,
    /// Connection replaced by this join, if it differs from the new one
    pub previous_connection: Option<ConnectionId>,
}

/// Result of removing a participant from a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub removed: bool,
    pub was_host: bool,
    pub became_empty: bool,
}

/// A live meeting room
#[derive(Debug)]
pub struct Room {
    code: RoomCode,
    session_id: SessionId,
    status: RoomStatus,
    host_id: String,
    host_name: String,
    router_id: String,
    router: Option<Arc<dyn RouterHandle>>,
    participants: HashMap<String, Participant>,
    created_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl Room {
    fn new(
        code: RoomCode,
        session_id: SessionId,
        host_id: &str,
        host_name: &str,
        router: Arc<dyn RouterHandle>,
    ) -> Self {
        Self {
            code,
            session_id,
            status: RoomStatus::Active,
            host_id: host_id.to_string(),
            host_name: host_name.to_string(),
            router_id: router.id().to_string(),
            router: Some(router),
            participants: HashMap::new(),
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn status(&self) -> RoomStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == RoomStatus::Active
    }

    pub fn router(&self) -> Option<&Arc<dyn RouterHandle>> {
        self.router.as_ref()
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.get(participant_id)
    }

    /// Participants in join order
    pub fn participants(&self) -> Vec<&Participant> {
        let mut list: Vec<_> = self.participants.values().collect();
        list.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.participant_id.cmp(&b.participant_id))
        });
        list
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Add or refresh a participant
    ///
    /// Joining twice with the same id keeps one entry; the display name and
    /// connection are updated and the original join time is kept.
    pub fn join(
        &mut self,
        participant_id: &str,
        display_name: &str,
        is_host: bool,
        connection: ConnectionId,
    ) -> Result<JoinOutcome> {
        if !self.is_active() {
            return Err(Error::NotFound(format!("meeting {}", self.code)));
        }

        let existing: Vec<ParticipantInfo> = self
            .participants()
            .into_iter()
            .filter(|p| p.participant_id != participant_id)
            .map(Participant::info)
            .collect();

        let (rejoined, previous_connection, joined_at) =
            match self.participants.get(participant_id) {
                Some(current) => (
                    true,
                    Some(current.connection).filter(|c| *c != connection),
                    current.joined_at,
                ),
                None => (false, None, Utc::now()),
            };

        let participant = Participant {
            participant_id: participant_id.to_string(),
            display_name: display_name.to_string(),
            is_host,
            joined_at,
            connection,
        };
        let info = participant.info();
        self.participants
            .insert(participant_id.to_string(), participant);

        assert_room_invariants(self);

        Ok(JoinOutcome {
            existing,
            participant: info,
            rejoined,
            previous_connection,
        })
    }

    /// Remove a participant regardless of which connection registered them
    pub fn leave(&mut self, participant_id: &str) -> LeaveOutcome {
        match self.participants.remove(participant_id) {
            Some(p) => LeaveOutcome {
                removed: true,
                was_host: p.is_host,
                became_empty: self.participants.is_empty(),
            },
            None => LeaveOutcome {
                removed: false,
                was_host: false,
                became_empty: self.participants.is_empty(),
            },
        }
    }

    /// Remove a participant only if `connection` still owns their entry
    pub fn leave_connection(&mut self, participant_id: &str, connection: ConnectionId) -> LeaveOutcome {
        let owned = self
            .participants
            .get(participant_id)
            .map(|p| p.connection == connection)
            .unwrap_or(false);
        if owned {
            self.leave(participant_id)
        } else {
            LeaveOutcome {
                removed: false,
                was_host: false,
                became_empty: self.participants.is_empty(),
            }
        }
    }

    /// Mark the room ended and hand back its router for closing
    fn end(&mut self) -> Option<Arc<dyn RouterHandle>> {
        if !self.is_active() {
            return None;
        }
        self.status = RoomStatus::Ended;
        self.ended_at = Some(Utc::now());
        self.participants.clear();
        let router = self.router.take();
        assert_room_invariants(self);
        router
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            code: self.code.clone(),
            session_id: self.session_id.clone(),
            status: self.status,
            host_id: self.host_id.clone(),
            host_name: self.host_name.clone(),
            router_id: self.router_id.clone(),
            participant_count: self.participants.len(),
            created_at: self.created_at,
            ended_at: self.ended_at,
        }
    }
}

#[derive(Default)]
struct RoomIndex {
    rooms: HashMap<RoomCode, Arc<Mutex<Room>>>,
    sessions: HashMap<SessionId, RoomCode>,
    /// Codes handed out to creations still waiting on a router
    reserved: HashSet<RoomCode>,
}

/// Holds a code in `reserved` until dropped, even if creation is cancelled
struct CodeReservation<'a> {
    index: &'a RwLock<RoomIndex>,
    code: RoomCode,
}

impl Drop for CodeReservation<'_> {
    fn drop(&mut self) {
        self.index.write().reserved.remove(&self.code);
    }
}

/// Registry of live rooms keyed by meeting code
pub struct RoomRegistry {
    media: Arc<dyn MediaRouter>,
    timeout: Duration,
    index: RwLock<RoomIndex>,
    creation: KeyedLocks<SessionId>,
}

impl RoomRegistry {
    pub fn new(media: Arc<dyn MediaRouter>, timeout: Duration) -> Self {
        Self {
            media,
            timeout,
            index: RwLock::new(RoomIndex::default()),
            creation: KeyedLocks::new(),
        }
    }

    fn room(&self, code: &RoomCode) -> Option<Arc<Mutex<Room>>> {
        self.index.read().rooms.get(code).cloned()
    }

    fn session_room(&self, session_id: &SessionId) -> Option<Arc<Mutex<Room>>> {
        let index = self.index.read();
        let code = index.sessions.get(session_id)?;
        index.rooms.get(code).cloned()
    }

    /// Return the session's live room, or create one
    ///
    /// Returns `(code, created)`. Router allocation runs outside every room
    /// lock and at most once per session at a time.
    pub async fn create_room(
        &self,
        session_id: &SessionId,
        host_name: &str,
        host_id: &str,
    ) -> Result<(RoomCode, bool)> {
        let _creation = self.creation.lock(session_id).await;

        if let Some(room) = self.session_room(session_id) {
            let room = room.lock();
            if room.is_active() {
                debug!(session_id = %session_id, code = %room.code, "Reusing live room");
                return Ok((room.code.clone(), false));
            }
        }

        let reservation = self.reserve_code();
        let code = reservation.code.clone();
        let router = match tokio::time::timeout(self.timeout, self.media.allocate_router()).await {
            Ok(Ok(router)) => router,
            Ok(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "Router allocation failed");
                return Err(e.into());
            }
            Err(_) => {
                warn!(session_id = %session_id, "Router allocation timed out");
                return Err(DependencyError::Timeout {
                    operation: "router allocation",
                    after: self.timeout,
                }
                .into());
            }
        };

        let room = Room::new(code.clone(), session_id.clone(), host_id, host_name, router);
        {
            let mut index = self.index.write();
            index
                .rooms
                .insert(code.clone(), Arc::new(Mutex::new(room)));
            index.sessions.insert(session_id.clone(), code.clone());
        }
        drop(reservation);

        info!(session_id = %session_id, code = %code, host = %host_name, "Room created");
        Ok((code, true))
    }

    /// Pick a code unused by any live or pending room
    fn reserve_code(&self) -> CodeReservation<'_> {
        let mut rng = rand::thread_rng();
        let mut index = self.index.write();
        loop {
            let code = RoomCode::random(&mut rng);
            if !index.rooms.contains_key(&code) && !index.reserved.contains(&code) {
                index.reserved.insert(code.clone());
                return CodeReservation {
                    index: &self.index,
                    code,
                };
            }
            debug!(code = %code, "Meeting code collision, retrying");
        }
    }

    /// End the session's room; no-op when it has none
    pub async fn end_room(&self, session_id: &SessionId) -> Option<RoomSummary> {
        let code = self.index.read().sessions.get(session_id).cloned()?;
        self.end_room_by_code(&code).await
    }

    /// End a room by code, releasing its router
    pub async fn end_room_by_code(&self, code: &RoomCode) -> Option<RoomSummary> {
        let room = self.room(code)?;
        let (summary, router) = {
            let mut room = room.lock();
            let router = room.end()?;
            (room.summary(), router)
        };

        {
            let mut index = self.index.write();
            index.rooms.remove(code);
            if index.sessions.get(&summary.session_id) == Some(code) {
                index.sessions.remove(&summary.session_id);
            }
        }

        if tokio::time::timeout(self.timeout, router.close()).await.is_err() {
            warn!(code = %code, router_id = %summary.router_id, "Router close timed out");
        }

        info!(code = %code, session_id = %summary.session_id, "Room ended");
        Some(summary)
    }

    pub fn get_room_info(&self, session_id: &SessionId) -> Result<RoomSummary> {
        self.session_room(session_id)
            .map(|room| room.lock().summary())
            .ok_or_else(|| Error::NotFound(format!("room for course {}", session_id)))
    }

    pub fn get_room_by_code(&self, code: &RoomCode) -> Result<RoomSummary> {
        self.room(code)
            .map(|room| room.lock().summary())
            .ok_or_else(|| Error::NotFound(format!("meeting {}", code)))
    }

    /// Run `f` under the room's lock
    ///
    /// Fails with `NotFound` when the room is unknown or already ended.
    pub fn with_room<R>(&self, code: &RoomCode, f: impl FnOnce(&mut Room) -> R) -> Result<R> {
        let room = self
            .room(code)
            .ok_or_else(|| Error::NotFound(format!("meeting {}", code)))?;
        let mut room = room.lock();
        if !room.is_active() {
            return Err(Error::NotFound(format!("meeting {}", code)));
        }
        Ok(f(&mut room))
    }

    pub fn join(
        &self,
        code: &RoomCode,
        participant_id: &str,
        display_name: &str,
        is_host: bool,
        connection: ConnectionId,
    ) -> Result<JoinOutcome> {
        self.with_room(code, |room| {
            room.join(participant_id, display_name, is_host, connection)
        })?
    }

    pub fn leave(&self, code: &RoomCode, participant_id: &str) -> Result<LeaveOutcome> {
        self.with_room(code, |room| room.leave(participant_id))
    }

    pub fn find_participant_connection(
        &self,
        code: &RoomCode,
        participant_id: &str,
    ) -> Result<ConnectionId> {
        self.with_room(code, |room| {
            room.participant(participant_id).map(|p| p.connection)
        })?
        .ok_or_else(|| Error::NotFound(format!("participant {} in meeting {}", participant_id, code)))
    }

    /// Ask the room's router for a transport
    pub async fn create_transport(&self, code: &RoomCode) -> Result<TransportDescriptor> {
        let router = self
            .with_room(code, |room| room.router().cloned())?
            .ok_or_else(|| {
                Error::from(DependencyError::Transport(format!(
                    "meeting {} has no router",
                    code
                )))
            })?;

        match tokio::time::timeout(self.timeout, router.create_transport()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DependencyError::Timeout {
                operation: "transport creation",
                after: self.timeout,
            }
            .into()),
        }
    }

    /// Summaries of every live room
    pub fn active_rooms(&self) -> Vec<RoomSummary> {
        let rooms: Vec<_> = self.index.read().rooms.values().cloned().collect();
        let mut summaries: Vec<_> = rooms
            .iter()
            .map(|room| room.lock())
            .filter(|room| room.is_active())
            .map(|room| room.summary())
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// End every live room, for shutdown
    pub async fn end_all(&self) -> usize {
        let codes: Vec<_> = self.index.read().rooms.keys().cloned().collect();
        let mut ended = 0;
        for code in codes {
            if self.end_room_by_code(&code).await.is_some() {
                ended += 1;
            }
        }
        ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeMediaRouter;
    use std::collections::HashSet;

    fn registry() -> (Arc<FakeMediaRouter>, RoomRegistry) {
        let media = Arc::new(FakeMediaRouter::default());
        let registry = RoomRegistry::new(media.clone(), Duration::from_millis(200));
        (media, registry)
    }

    #[tokio::test]
    async fn test_create_room_reuses_live_room() {
        let (media, registry) = registry();
        let session = SessionId::from("course_1");

        let (code, created) = registry.create_room(&session, "Jane", "inst").await.unwrap();
        assert!(created);
        let (again, created) = registry.create_room(&session, "Jane", "inst").await.unwrap();
        assert!(!created);
        assert_eq!(code, again);
        assert_eq!(media.allocations(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_allocates_once() {
        let (media, registry) = registry();
        let registry = Arc::new(registry);
        let session = SessionId::from("course_1");

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let registry = registry.clone();
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                registry.create_room(&session, "Jane", "inst").await.unwrap()
            }));
        }
        let mut codes = HashSet::new();
        let mut created = 0;
        for task in tasks {
            let (code, was_created) = task.await.unwrap();
            codes.insert(code);
            created += was_created as usize;
        }

        assert_eq!(codes.len(), 1);
        assert_eq!(created, 1);
        assert_eq!(media.allocations(), 1);
    }

    #[tokio::test]
    async fn test_codes_unique_across_sessions() {
        let (_, registry) = registry();
        let registry = Arc::new(registry);

        let mut tasks = Vec::new();
        for i in 0..50 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let session = SessionId::new(format!("course_{}", i));
                registry.create_room(&session, "Host", "inst").await.unwrap().0
            }));
        }
        let mut codes = HashSet::new();
        for task in tasks {
            let code = task.await.unwrap();
            assert!(RoomCode::is_valid(code.as_str()));
            codes.insert(code);
        }
        assert_eq!(codes.len(), 50);
        assert_eq!(registry.active_rooms().len(), 50);
    }

    #[tokio::test]
    async fn test_allocation_failure_registers_nothing() {
        let (media, registry) = registry();
        media.fail_allocations(true);
        let session = SessionId::from("course_1");

        let err = registry.create_room(&session, "Jane", "inst").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DependencyFailure);
        assert!(registry.get_room_info(&session).is_err());
        assert!(registry.active_rooms().is_empty());
        assert!(registry.index.read().reserved.is_empty());
    }

    #[tokio::test]
    async fn test_allocation_timeout_is_failure() {
        let (media, registry) = registry();
        media.stall_allocations(Duration::from_secs(5));
        let session = SessionId::from("course_1");

        let err = registry.create_room(&session, "Jane", "inst").await.unwrap_err();
        assert!(matches!(
            err,
            Error::DependencyFailure(DependencyError::Timeout { .. })
        ));
        assert!(registry.get_room_info(&session).is_err());
    }

    #[tokio::test]
    async fn test_cancelled_creation_releases_code() {
        let (media, registry) = registry();
        media.stall_allocations(Duration::from_secs(5));
        let session = SessionId::from("course_1");

        let pending = registry.create_room(&session, "Jane", "inst");
        let cancelled = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(cancelled.is_err());
        assert!(registry.index.read().reserved.is_empty());

        media.stall_allocations(Duration::ZERO);
        let (code, created) = registry.create_room(&session, "Jane", "inst").await.unwrap();
        assert!(created);
        assert!(registry.index.read().reserved.is_empty());
        assert!(registry.get_room_by_code(&code).is_ok());
    }

    #[tokio::test]
    async fn test_join_is_idempotent_and_returns_pre_join_snapshot() {
        let (_, registry) = registry();
        let session = SessionId::from("course_1");
        let (code, _) = registry.create_room(&session, "Jane", "inst").await.unwrap();

        let host = ConnectionId::next();
        let outcome = registry.join(&code, "host", "Jane", true, host).unwrap();
        assert!(outcome.existing.is_empty());
        assert!(!outcome.rejoined);

        let student = ConnectionId::next();
        let outcome = registry.join(&code, "p1", "Alice", false, student).unwrap();
        assert_eq!(outcome.existing.len(), 1);
        assert_eq!(outcome.existing[0].participant_id, "host");

        let outcome = registry.join(&code, "p1", "Alice B", false, student).unwrap();
        assert!(outcome.rejoined);
        assert!(outcome.previous_connection.is_none());
        assert_eq!(outcome.existing.len(), 1);

        let summary = registry.get_room_by_code(&code).unwrap();
        assert_eq!(summary.participant_count, 2);
        registry
            .with_room(&code, |room| {
                assert_eq!(room.participant("p1").unwrap().display_name, "Alice B");
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejoin_from_new_connection_reports_replaced_one() {
        let (_, registry) = registry();
        let (code, _) = registry
            .create_room(&SessionId::from("course_1"), "Jane", "inst")
            .await
            .unwrap();

        let first = ConnectionId::next();
        let second = ConnectionId::next();
        registry.join(&code, "p1", "Alice", false, first).unwrap();
        let outcome = registry.join(&code, "p1", "Alice", false, second).unwrap();
        assert_eq!(outcome.previous_connection, Some(first));
        assert_eq!(
            registry.find_participant_connection(&code, "p1").unwrap(),
            second
        );

        let stale = registry
            .with_room(&code, |room| room.leave_connection("p1", first))
            .unwrap();
        assert!(!stale.removed);
        assert_eq!(registry.get_room_by_code(&code).unwrap().participant_count, 1);
    }

    #[tokio::test]
    async fn test_leave_reports_host_and_empty() {
        let (_, registry) = registry();
        let (code, _) = registry
            .create_room(&SessionId::from("course_1"), "Jane", "inst")
            .await
            .unwrap();
        registry.join(&code, "host", "Jane", true, ConnectionId::next()).unwrap();
        registry.join(&code, "p1", "Alice", false, ConnectionId::next()).unwrap();

        let outcome = registry.leave(&code, "p1").unwrap();
        assert!(outcome.removed && !outcome.was_host && !outcome.became_empty);

        let outcome = registry.leave(&code, "host").unwrap();
        assert!(outcome.removed && outcome.was_host && outcome.became_empty);

        let outcome = registry.leave(&code, "ghost").unwrap();
        assert!(!outcome.removed);
    }

    #[tokio::test]
    async fn test_end_room_closes_router_and_rejects_joins() {
        let (media, registry) = registry();
        let session = SessionId::from("course_1");
        let (code, _) = registry.create_room(&session, "Jane", "inst").await.unwrap();
        registry.join(&code, "p1", "Alice", false, ConnectionId::next()).unwrap();

        let summary = registry.end_room(&session).await.unwrap();
        assert_eq!(summary.status, RoomStatus::Ended);
        assert_eq!(summary.participant_count, 0);
        assert_eq!(media.closes(), 1);

        assert!(registry.end_room(&session).await.is_none());
        assert_eq!(media.closes(), 1);
        assert!(matches!(
            registry.join(&code, "p2", "Bob", false, ConnectionId::next()),
            Err(Error::NotFound(_))
        ));
        assert!(registry.get_room_info(&session).is_err());
    }

    #[tokio::test]
    async fn test_new_room_after_end() {
        let (media, registry) = registry();
        let session = SessionId::from("course_1");
        registry.create_room(&session, "Jane", "inst").await.unwrap();
        registry.end_room(&session).await;

        let (_, created) = registry.create_room(&session, "Jane", "inst").await.unwrap();
        assert!(created);
        assert_eq!(media.allocations(), 2);
    }

    #[tokio::test]
    async fn test_create_transport() {
        let (media, registry) = registry();
        let session = SessionId::from("course_1");
        let (code, _) = registry.create_room(&session, "Jane", "inst").await.unwrap();

        let transport = registry.create_transport(&code).await.unwrap();
        assert!(!transport.transport_id.is_empty());
        assert_eq!(media.transports(), 1);

        registry.end_room(&session).await;
        assert!(matches!(
            registry.create_transport(&code).await,
            Err(Error::NotFound(_))
        ));
    }
}
