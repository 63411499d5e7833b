//! Signaling relay
//!
//! Routes signaling events between the participants of a meeting. Every
//! fan-out for a room is issued while that room's lock is held, so each
//! peer sees a room's events in the order the room accepted them.
//!
//! Lock order: room (through [`RoomRegistry::with_room`]), then the
//! connection table.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use livecourse_core::{
    ConnectionId, Error as CoreError, ErrorKind, Room, RoomCode, RoomRegistry,
};

use crate::protocol::{
    AudioToggle, ChatMessage, ClientEvent, Confirmation, JoinMeeting, JoinedMeeting,
    ParticipantLeft, RelayedCandidate, RelayedSdp, ScreenShareStarted, ScreenShareStopped,
    ServerEvent, VideoToggle, WireError, MAX_CHAT_CHARS,
};

/// Failures reported to a signaling client as `error` events
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Meeting {0} not found")]
    MeetingNotFound(String),

    #[error("You are not in a meeting")]
    NotInMeeting,

    #[error("Only the host can share the screen")]
    ScreenShareNotAllowed,

    #[error("Meeting router unavailable: {0}")]
    RouterUnavailable(String),

    #[error("Failed to create transport: {0}")]
    TransportFailed(String),

    #[error("Failed to join meeting: {0}")]
    JoinFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

impl RelayError {
    /// `type` field of the wire error
    pub fn wire_type(&self) -> &'static str {
        match self {
            RelayError::MeetingNotFound(_) => "meeting-not-found",
            RelayError::NotInMeeting => "not-in-meeting",
            RelayError::ScreenShareNotAllowed => "screen-share-not-allowed",
            RelayError::RouterUnavailable(_) => "meeting-router-error",
            RelayError::TransportFailed(_) => "transport-creation-error",
            RelayError::JoinFailed(_) => "join-meeting-error",
            RelayError::InvalidMessage(_) => "invalid-message",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::MeetingNotFound(_) => ErrorKind::NotFound,
            RelayError::NotInMeeting => ErrorKind::InvalidState,
            RelayError::ScreenShareNotAllowed => ErrorKind::NotAuthorized,
            RelayError::RouterUnavailable(_)
            | RelayError::TransportFailed(_)
            | RelayError::JoinFailed(_) => ErrorKind::DependencyFailure,
            RelayError::InvalidMessage(_) => ErrorKind::InvalidInput,
        }
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::Error(WireError {
            kind: self.wire_type().to_string(),
            message: self.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
struct Membership {
    code: RoomCode,
    participant_id: String,
    display_name: String,
    is_host: bool,
}

struct Connection {
    tx: mpsc::UnboundedSender<ServerEvent>,
    membership: Option<Membership>,
}

type Connections = HashMap<ConnectionId, Connection>;

fn deliver(connections: &Connections, to: ConnectionId, event: ServerEvent) {
    if let Some(connection) = connections.get(&to) {
        if connection.tx.send(event).is_err() {
            debug!(connection = %to, "Connection writer gone, event dropped");
        }
    }
}

/// Connections of everyone in the room except `participant_id`
fn others(room: &Room, participant_id: &str) -> Vec<ConnectionId> {
    room.participants()
        .into_iter()
        .filter(|p| p.participant_id != participant_id)
        .map(|p| p.connection)
        .collect()
}

fn everyone(room: &Room) -> Vec<ConnectionId> {
    room.participants().into_iter().map(|p| p.connection).collect()
}

pub struct SignalingRelay {
    rooms: Arc<RoomRegistry>,
    connections: Mutex<Connections>,
}

impl SignalingRelay {
    pub fn new(rooms: Arc<RoomRegistry>) -> Self {
        Self {
            rooms,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Track a new connection; events for it arrive on the receiver
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = ConnectionId::next();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().insert(
            id,
            Connection {
                tx,
                membership: None,
            },
        );
        (id, rx)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Meeting code the connection is currently in
    pub fn meeting_of(&self, conn: ConnectionId) -> Option<RoomCode> {
        self.current_membership(conn).map(|m| m.code)
    }

    fn current_membership(&self, conn: ConnectionId) -> Option<Membership> {
        self.connections
            .lock()
            .get(&conn)
            .and_then(|c| c.membership.clone())
    }

    fn membership(&self, conn: ConnectionId) -> Result<Membership, RelayError> {
        self.current_membership(conn)
            .ok_or(RelayError::NotInMeeting)
    }

    fn send(&self, conn: ConnectionId, event: ServerEvent) {
        deliver(&self.connections.lock(), conn, event);
    }

    fn send_all(&self, targets: Vec<ConnectionId>, event: &ServerEvent) {
        let connections = self.connections.lock();
        for target in targets {
            deliver(&connections, target, event.clone());
        }
    }

    /// Run `f` under the member's room lock, if they still own their seat
    fn in_room<R>(
        &self,
        conn: ConnectionId,
        member: &Membership,
        f: impl FnOnce(&Room) -> R,
    ) -> Result<R, RelayError> {
        self.rooms
            .with_room(&member.code, |room| {
                let owns = room
                    .participant(&member.participant_id)
                    .map_or(false, |p| p.connection == conn);
                if owns {
                    Ok(f(&*room))
                } else {
                    Err(RelayError::NotInMeeting)
                }
            })
            .map_err(|_| RelayError::NotInMeeting)?
    }

    /// Handle an event and report any failure back to the sender
    pub async fn dispatch(&self, conn: ConnectionId, event: ClientEvent) {
        let name = event.name();
        if let Err(e) = self.handle(conn, event).await {
            debug!(connection = %conn, event = name, error = %e, "Signaling request failed");
            self.send(conn, e.to_event());
        }
    }

    /// Report a frame that could not be decoded
    pub fn reject(&self, conn: ConnectionId, reason: impl Into<String>) {
        self.send(conn, RelayError::InvalidMessage(reason.into()).to_event());
    }

    pub async fn handle(&self, conn: ConnectionId, event: ClientEvent) -> Result<(), RelayError> {
        match event {
            ClientEvent::JoinMeeting(join) => self.join_meeting(conn, join).await,
            ClientEvent::ChatMessage { message } => self.chat(conn, message),
            ClientEvent::Offer { sdp, to } => self.signal(conn, to, |from, from_name| {
                ServerEvent::Offer(RelayedSdp {
                    sdp,
                    from,
                    from_name,
                })
            }),
            ClientEvent::Answer { sdp, to } => self.signal(conn, to, |from, from_name| {
                ServerEvent::Answer(RelayedSdp {
                    sdp,
                    from,
                    from_name,
                })
            }),
            ClientEvent::IceCandidate { candidate, to } => {
                self.signal(conn, to, |from, from_name| {
                    ServerEvent::IceCandidate(RelayedCandidate {
                        candidate,
                        from,
                        from_name,
                    })
                })
            }
            ClientEvent::ToggleAudio { enabled } => self.broadcast_from(conn, false, |m| {
                ServerEvent::ParticipantAudioToggle(AudioToggle {
                    participant_id: m.participant_id.clone(),
                    participant_name: m.display_name.clone(),
                    audio_enabled: enabled,
                })
            }),
            ClientEvent::ToggleVideo { enabled } => self.broadcast_from(conn, false, |m| {
                ServerEvent::ParticipantVideoToggle(VideoToggle {
                    participant_id: m.participant_id.clone(),
                    participant_name: m.display_name.clone(),
                    video_enabled: enabled,
                })
            }),
            ClientEvent::StartScreenShare {} => self.screen_share(conn, true),
            ClientEvent::StopScreenShare {} => self.screen_share(conn, false),
            ClientEvent::ScreenShareOffer { sdp } => self.broadcast_from(conn, true, |m| {
                ServerEvent::ScreenShareOffer(RelayedSdp {
                    sdp,
                    from: m.participant_id.clone(),
                    from_name: m.display_name.clone(),
                })
            }),
            ClientEvent::ScreenShareAnswer { sdp } => self.broadcast_from(conn, false, |m| {
                ServerEvent::ScreenShareAnswer(RelayedSdp {
                    sdp,
                    from: m.participant_id.clone(),
                    from_name: m.display_name.clone(),
                })
            }),
            ClientEvent::ScreenShareIceCandidate { candidate } => {
                self.broadcast_from(conn, false, |m| {
                    ServerEvent::ScreenShareIceCandidate(RelayedCandidate {
                        candidate,
                        from: m.participant_id.clone(),
                        from_name: m.display_name.clone(),
                    })
                })
            }
            ClientEvent::CreateTransport {} => self.create_transport(conn).await,
            ClientEvent::LeaveMeeting {} => {
                self.leave(conn).await;
                Ok(())
            }
            ClientEvent::Ping {} => {
                self.send(conn, ServerEvent::Pong {});
                Ok(())
            }
        }
    }

    async fn join_meeting(&self, conn: ConnectionId, join: JoinMeeting) -> Result<(), RelayError> {
        let code = RoomCode::parse(join.meeting_code.trim()).map_err(|_| {
            RelayError::InvalidMessage(format!(
                "meeting code must be 6 digits, got {:?}",
                join.meeting_code
            ))
        })?;
        let participant_id = join.participant_id.trim().to_string();
        if participant_id.is_empty() {
            return Err(RelayError::InvalidMessage("participantId is required".into()));
        }
        let display_name = match join.participant_name.trim() {
            "" => participant_id.clone(),
            name => name.to_string(),
        };

        if let Some(current) = self.current_membership(conn) {
            if current.code != code || current.participant_id != participant_id {
                self.leave(conn).await;
            }
        }

        let member = Membership {
            code: code.clone(),
            participant_id,
            display_name,
            is_host: join.is_host,
        };

        let joined = self
            .rooms
            .with_room(&code, |room| {
                let outcome =
                    room.join(&member.participant_id, &member.display_name, member.is_host, conn)?;
                let router_id = room
                    .router()
                    .map(|r| r.id().to_string())
                    .unwrap_or_default();

                let mut connections = self.connections.lock();
                match connections.get_mut(&conn) {
                    Some(c) => c.membership = Some(member.clone()),
                    None => {
                        room.leave_connection(&member.participant_id, conn);
                        return Err(CoreError::InvalidInput("connection closed".into()));
                    }
                }
                if let Some(previous) = outcome.previous_connection {
                    if let Some(c) = connections.get_mut(&previous) {
                        c.membership = None;
                    }
                }

                if !outcome.rejoined {
                    let joined = ServerEvent::ParticipantJoined(outcome.participant.clone());
                    for target in others(room, &member.participant_id) {
                        deliver(&connections, target, joined.clone());
                    }
                }
                deliver(
                    &connections,
                    conn,
                    ServerEvent::CurrentParticipants(outcome.existing.clone()),
                );
                deliver(
                    &connections,
                    conn,
                    ServerEvent::JoinedMeeting(JoinedMeeting {
                        meeting_code: code.to_string(),
                        participant_id: member.participant_id.clone(),
                        participant_name: member.display_name.clone(),
                        participant_count: room.participant_count(),
                        is_host: member.is_host,
                        router_id,
                    }),
                );
                Ok(outcome)
            })
            .and_then(|r| r);

        match joined {
            Ok(outcome) => {
                info!(
                    code = %code,
                    participant_id = %member.participant_id,
                    is_host = member.is_host,
                    rejoined = outcome.rejoined,
                    "Participant joined meeting"
                );
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(RelayError::MeetingNotFound(code.to_string()))
            }
            Err(e) => Err(RelayError::JoinFailed(e.to_string())),
        }
    }

    fn chat(&self, conn: ConnectionId, message: String) -> Result<(), RelayError> {
        if message.trim().is_empty() {
            return Err(RelayError::InvalidMessage("chat message is empty".into()));
        }
        if message.chars().count() > MAX_CHAT_CHARS {
            return Err(RelayError::InvalidMessage(format!(
                "chat message exceeds {} characters",
                MAX_CHAT_CHARS
            )));
        }

        let member = self.membership(conn)?;
        self.in_room(conn, &member, |room| {
            let event = ServerEvent::ChatMessage(ChatMessage {
                id: Uuid::new_v4(),
                message,
                sender: member.display_name.clone(),
                sender_id: member.participant_id.clone(),
                is_host: member.is_host,
                timestamp: Utc::now(),
            });
            self.send_all(everyone(room), &event);
        })
    }

    /// Unicast to `to`, or broadcast to the rest of the room
    fn signal(
        &self,
        conn: ConnectionId,
        to: Option<String>,
        build: impl FnOnce(String, String) -> ServerEvent,
    ) -> Result<(), RelayError> {
        let member = self.membership(conn)?;
        let event = build(member.participant_id.clone(), member.display_name.clone());
        self.in_room(conn, &member, |room| {
            let targets = match &to {
                Some(target) => match room.participant(target) {
                    Some(p) => vec![p.connection],
                    None => {
                        debug!(code = %member.code, target = %target, "Signaling target not in meeting, dropped");
                        Vec::new()
                    }
                },
                None => others(room, &member.participant_id),
            };
            self.send_all(targets, &event);
        })
    }

    fn broadcast_from(
        &self,
        conn: ConnectionId,
        host_only: bool,
        build: impl FnOnce(&Membership) -> ServerEvent,
    ) -> Result<(), RelayError> {
        let member = self.membership(conn)?;
        if host_only && !member.is_host {
            return Err(RelayError::ScreenShareNotAllowed);
        }
        let event = build(&member);
        self.in_room(conn, &member, |room| {
            self.send_all(others(room, &member.participant_id), &event);
        })
    }

    fn screen_share(&self, conn: ConnectionId, start: bool) -> Result<(), RelayError> {
        let member = self.membership(conn)?;
        if !member.is_host {
            return Err(RelayError::ScreenShareNotAllowed);
        }

        let now = Utc::now();
        let (event, confirmation) = if start {
            (
                ServerEvent::ScreenShareStarted(ScreenShareStarted {
                    host_id: member.participant_id.clone(),
                    host_name: member.display_name.clone(),
                    started_at: now,
                }),
                ServerEvent::ScreenShareStartedConfirmation(Confirmation {
                    success: true,
                    message: "Screen sharing started".into(),
                }),
            )
        } else {
            (
                ServerEvent::ScreenShareStopped(ScreenShareStopped {
                    host_id: member.participant_id.clone(),
                    host_name: member.display_name.clone(),
                    stopped_at: now,
                }),
                ServerEvent::ScreenShareStoppedConfirmation(Confirmation {
                    success: true,
                    message: "Screen sharing stopped".into(),
                }),
            )
        };

        self.in_room(conn, &member, |room| {
            self.send_all(others(room, &member.participant_id), &event);
            self.send(conn, confirmation);
        })?;
        info!(code = %member.code, host = %member.participant_id, sharing = start, "Screen share toggled");
        Ok(())
    }

    async fn create_transport(&self, conn: ConnectionId) -> Result<(), RelayError> {
        let member = self
            .current_membership(conn)
            .ok_or_else(|| RelayError::RouterUnavailable("not in a meeting".into()))?;
        let transport = self
            .rooms
            .create_transport(&member.code)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => RelayError::RouterUnavailable(e.to_string()),
                _ => RelayError::TransportFailed(e.to_string()),
            })?;
        debug!(code = %member.code, transport_id = %transport.transport_id, "Transport created");
        self.send(conn, ServerEvent::TransportCreated(transport));
        Ok(())
    }

    /// Take the connection out of its meeting
    ///
    /// The meeting ends when the host leaves or the last participant goes.
    pub async fn leave(&self, conn: ConnectionId) {
        let member = match self
            .connections
            .lock()
            .get_mut(&conn)
            .and_then(|c| c.membership.take())
        {
            Some(member) => member,
            None => return,
        };

        let outcome = self.rooms.with_room(&member.code, |room| {
            let outcome = room.leave_connection(&member.participant_id, conn);
            if outcome.removed {
                let left = ServerEvent::ParticipantLeft(ParticipantLeft {
                    participant_id: member.participant_id.clone(),
                    participant_name: member.display_name.clone(),
                    left_at: Utc::now(),
                    was_host: outcome.was_host,
                });
                self.send_all(everyone(room), &left);
            }
            outcome
        });
        let outcome = match outcome {
            Ok(outcome) if outcome.removed => outcome,
            _ => {
                debug!(code = %member.code, participant_id = %member.participant_id, "Nothing to leave");
                return;
            }
        };

        info!(
            code = %member.code,
            participant_id = %member.participant_id,
            was_host = outcome.was_host,
            "Participant left meeting"
        );

        if outcome.was_host || outcome.became_empty {
            let reason = if outcome.was_host { "host left" } else { "meeting empty" };
            match self.rooms.end_room_by_code(&member.code).await {
                Some(summary) => {
                    info!(code = %member.code, session_id = %summary.session_id, reason, "Meeting ended")
                }
                None => warn!(code = %member.code, reason, "Meeting already ended"),
            }
        }
    }

    /// Forget a closed connection
    pub async fn disconnect(&self, conn: ConnectionId) {
        self.leave(conn).await;
        self.connections.lock().remove(&conn);
        debug!(connection = %conn, "Connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecourse_core::test_support::FakeMediaRouter;
    use livecourse_core::SessionId;
    use serde_json::json;
    use std::time::Duration;

    struct Peer {
        conn: ConnectionId,
        rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    async fn setup() -> (Arc<SignalingRelay>, Arc<FakeMediaRouter>, RoomCode) {
        let media = Arc::new(FakeMediaRouter::default());
        let rooms = Arc::new(RoomRegistry::new(media.clone(), Duration::from_millis(200)));
        let (code, _) = rooms
            .create_room(&SessionId::from("course_1"), "Jane Doe", "instructor_456")
            .await
            .unwrap();
        (Arc::new(SignalingRelay::new(rooms)), media, code)
    }

    fn connect(relay: &SignalingRelay) -> Peer {
        let (conn, rx) = relay.register();
        Peer { conn, rx }
    }

    fn join(code: &RoomCode, id: &str, name: &str, is_host: bool) -> ClientEvent {
        ClientEvent::JoinMeeting(JoinMeeting {
            meeting_code: code.to_string(),
            participant_id: id.into(),
            participant_name: name.into(),
            is_host,
        })
    }

    async fn joined(relay: &SignalingRelay, code: &RoomCode, id: &str, is_host: bool) -> Peer {
        let mut peer = connect(relay);
        relay
            .handle(peer.conn, join(code, id, id, is_host))
            .await
            .unwrap();
        peer.drain();
        peer
    }

    #[tokio::test]
    async fn test_join_snapshot_and_announcement() {
        let (relay, _, code) = setup().await;

        let mut host = connect(&relay);
        relay
            .handle(host.conn, join(&code, "host", "Jane Doe", true))
            .await
            .unwrap();
        let events = host.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], ServerEvent::CurrentParticipants(vec![]));
        match &events[1] {
            ServerEvent::JoinedMeeting(j) => {
                assert_eq!(j.meeting_code, code.to_string());
                assert!(j.is_host);
                assert_eq!(j.participant_count, 1);
                assert_eq!(j.router_id, "router-1");
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut student = connect(&relay);
        relay
            .handle(student.conn, join(&code, "s1", "Alice", false))
            .await
            .unwrap();

        match host.drain().as_slice() {
            [ServerEvent::ParticipantJoined(p)] => {
                assert_eq!(p.participant_id, "s1");
                assert_eq!(p.participant_name, "Alice");
            }
            other => panic!("unexpected {:?}", other),
        }
        match student.drain().as_slice() {
            [ServerEvent::CurrentParticipants(list), ServerEvent::JoinedMeeting(j)] => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].participant_id, "host");
                assert_eq!(j.participant_count, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(relay.meeting_of(student.conn), Some(code));
    }

    #[tokio::test]
    async fn test_join_unknown_meeting() {
        let (relay, _, _) = setup().await;
        let mut peer = connect(&relay);
        let code = RoomCode::parse("000001").unwrap();

        let err = relay
            .handle(peer.conn, join(&code, "p1", "Alice", false))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::MeetingNotFound(_)));

        relay.dispatch(peer.conn, join(&code, "p1", "Alice", false)).await;
        match peer.drain().as_slice() {
            [ServerEvent::Error(e)] => assert_eq!(e.kind, "meeting-not-found"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_validates_input() {
        let (relay, _, code) = setup().await;
        let peer = connect(&relay);

        let bad_code = ClientEvent::JoinMeeting(JoinMeeting {
            meeting_code: "12ab56".into(),
            participant_id: "p1".into(),
            participant_name: "Alice".into(),
            is_host: false,
        });
        let err = relay.handle(peer.conn, bad_code).await.unwrap_err();
        assert_eq!(err.wire_type(), "invalid-message");

        let err = relay
            .handle(peer.conn, join(&code, "  ", "Alice", false))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_chat_stamps_sender_and_reaches_everyone() {
        let (relay, _, code) = setup().await;
        let mut host = joined(&relay, &code, "host", true).await;
        let mut student = joined(&relay, &code, "s1", false).await;
        host.drain();

        relay
            .handle(student.conn, ClientEvent::ChatMessage { message: "hi".into() })
            .await
            .unwrap();

        for events in [host.drain(), student.drain()] {
            match events.as_slice() {
                [ServerEvent::ChatMessage(m)] => {
                    assert_eq!(m.message, "hi");
                    assert_eq!(m.sender_id, "s1");
                    assert!(!m.is_host);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_chat_rejections() {
        let (relay, _, code) = setup().await;
        let outsider = connect(&relay);
        let err = relay
            .handle(outsider.conn, ClientEvent::ChatMessage { message: "hi".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotInMeeting));

        let member = joined(&relay, &code, "s1", false).await;
        for message in ["   ".to_string(), "x".repeat(MAX_CHAT_CHARS + 1)] {
            let err = relay
                .handle(member.conn, ClientEvent::ChatMessage { message })
                .await
                .unwrap_err();
            assert_eq!(err.wire_type(), "invalid-message");
        }
        relay
            .handle(
                member.conn,
                ClientEvent::ChatMessage {
                    message: "x".repeat(MAX_CHAT_CHARS),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_targeted_and_broadcast_signaling() {
        let (relay, _, code) = setup().await;
        let mut host = joined(&relay, &code, "host", true).await;
        let mut a = joined(&relay, &code, "a", false).await;
        let mut b = joined(&relay, &code, "b", false).await;
        host.drain();
        a.drain();

        relay
            .handle(
                host.conn,
                ClientEvent::Offer {
                    sdp: json!("v=0"),
                    to: Some("a".into()),
                },
            )
            .await
            .unwrap();
        match a.drain().as_slice() {
            [ServerEvent::Offer(o)] => {
                assert_eq!(o.from, "host");
                assert_eq!(o.sdp, json!("v=0"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(b.drain().is_empty());
        assert!(host.drain().is_empty());

        relay
            .handle(
                host.conn,
                ClientEvent::Answer {
                    sdp: json!("v=0"),
                    to: Some("ghost".into()),
                },
            )
            .await
            .unwrap();
        assert!(a.drain().is_empty() && b.drain().is_empty());

        relay
            .handle(
                a.conn,
                ClientEvent::IceCandidate {
                    candidate: json!({"candidate": "c"}),
                    to: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(host.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_toggles_go_to_others() {
        let (relay, _, code) = setup().await;
        let mut host = joined(&relay, &code, "host", true).await;
        let mut student = joined(&relay, &code, "s1", false).await;
        host.drain();

        relay
            .handle(student.conn, ClientEvent::ToggleVideo { enabled: false })
            .await
            .unwrap();
        match host.drain().as_slice() {
            [ServerEvent::ParticipantVideoToggle(t)] => {
                assert_eq!(t.participant_id, "s1");
                assert!(!t.video_enabled);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(student.drain().is_empty());
    }

    #[tokio::test]
    async fn test_screen_share_is_host_only() {
        let (relay, _, code) = setup().await;
        let mut host = joined(&relay, &code, "host", true).await;
        let mut student = joined(&relay, &code, "s1", false).await;
        host.drain();

        let err = relay
            .handle(student.conn, ClientEvent::StartScreenShare {})
            .await
            .unwrap_err();
        assert_eq!(err.wire_type(), "screen-share-not-allowed");
        let err = relay
            .handle(student.conn, ClientEvent::ScreenShareOffer { sdp: json!("v=0") })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAuthorized);

        relay
            .handle(host.conn, ClientEvent::StartScreenShare {})
            .await
            .unwrap();
        assert!(matches!(
            student.drain().as_slice(),
            [ServerEvent::ScreenShareStarted(_)]
        ));
        assert!(matches!(
            host.drain().as_slice(),
            [ServerEvent::ScreenShareStartedConfirmation(Confirmation { success: true, .. })]
        ));

        relay
            .handle(student.conn, ClientEvent::ScreenShareAnswer { sdp: json!("v=0") })
            .await
            .unwrap();
        assert!(matches!(
            host.drain().as_slice(),
            [ServerEvent::ScreenShareAnswer(RelayedSdp { from, .. })] if from == "s1"
        ));
    }

    #[tokio::test]
    async fn test_host_disconnect_ends_meeting() {
        let (relay, media, code) = setup().await;
        let host = joined(&relay, &code, "host", true).await;
        let mut student = joined(&relay, &code, "s1", false).await;

        let before = Utc::now();
        relay.disconnect(host.conn).await;

        match student.drain().as_slice() {
            [ServerEvent::ParticipantLeft(left)] => {
                assert_eq!(left.participant_id, "host");
                assert!(left.was_host);
                assert!(left.left_at >= before && left.left_at <= Utc::now());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(relay.rooms().get_room_by_code(&code).is_err());
        assert_eq!(media.closes(), 1);

        let late = connect(&relay);
        let err = relay
            .handle(late.conn, join(&code, "s2", "Bob", false))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::MeetingNotFound(_)));

        let err = relay
            .handle(student.conn, ClientEvent::ChatMessage { message: "hello?".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotInMeeting));
    }

    #[tokio::test]
    async fn test_last_participant_leaving_ends_meeting() {
        let (relay, _, code) = setup().await;
        let student = joined(&relay, &code, "s1", false).await;

        relay
            .handle(student.conn, ClientEvent::LeaveMeeting {})
            .await
            .unwrap();
        assert!(relay.rooms().get_room_by_code(&code).is_err());
        assert_eq!(relay.meeting_of(student.conn), None);
        assert_eq!(relay.connection_count(), 1);

        relay.disconnect(student.conn).await;
        assert_eq!(relay.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_join_same_participant() {
        let (relay, _, code) = setup().await;
        let _host = joined(&relay, &code, "host", true).await;
        let mut first = connect(&relay);
        let mut second = connect(&relay);

        let (a, b) = tokio::join!(
            relay.handle(first.conn, join(&code, "s1", "Alice", false)),
            relay.handle(second.conn, join(&code, "s1", "Alice", false)),
        );
        a.unwrap();
        b.unwrap();

        // Both callers are acknowledged and see the same seat count
        for peer in [&mut first, &mut second] {
            let acks: Vec<_> = peer
                .drain()
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::JoinedMeeting(j) => Some(j),
                    _ => None,
                })
                .collect();
            assert_eq!(acks.len(), 1);
            assert_eq!(acks[0].participant_id, "s1");
            assert_eq!(acks[0].participant_count, 2);
        }

        let owner = relay
            .rooms()
            .find_participant_connection(&code, "s1")
            .unwrap();
        assert!(owner == first.conn || owner == second.conn);
        assert_eq!(relay.rooms().get_room_by_code(&code).unwrap().participant_count, 2);

        let stale = if owner == first.conn { second.conn } else { first.conn };
        assert_eq!(relay.meeting_of(stale), None);

        // Closing the superseded connection leaves the seat alone
        relay.disconnect(stale).await;
        assert_eq!(
            relay.rooms().find_participant_connection(&code, "s1").unwrap(),
            owner
        );
    }

    #[tokio::test]
    async fn test_switching_meetings_leaves_previous() {
        let (relay, _, first) = setup().await;
        let (second, _) = relay
            .rooms()
            .create_room(&SessionId::from("course_2"), "Other", "instructor_2")
            .await
            .unwrap();
        let mut host = joined(&relay, &first, "host", true).await;
        let mover = joined(&relay, &first, "s1", false).await;
        host.drain();

        relay
            .handle(mover.conn, join(&second, "s1", "Alice", false))
            .await
            .unwrap();

        assert!(matches!(
            host.drain().as_slice(),
            [ServerEvent::ParticipantLeft(_)]
        ));
        assert_eq!(relay.rooms().get_room_by_code(&first).unwrap().participant_count, 1);
        assert_eq!(relay.meeting_of(mover.conn), Some(second));
    }

    #[tokio::test]
    async fn test_create_transport() {
        let (relay, media, code) = setup().await;
        let outsider = connect(&relay);
        let err = relay
            .handle(outsider.conn, ClientEvent::CreateTransport {})
            .await
            .unwrap_err();
        assert_eq!(err.wire_type(), "meeting-router-error");

        let mut member = joined(&relay, &code, "s1", false).await;
        relay
            .handle(member.conn, ClientEvent::CreateTransport {})
            .await
            .unwrap();
        match member.drain().as_slice() {
            [ServerEvent::TransportCreated(t)] => assert_eq!(t.transport_id, "router-1-transport-1"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(media.transports(), 1);
    }

    #[tokio::test]
    async fn test_ping() {
        let (relay, _, _) = setup().await;
        let mut peer = connect(&relay);
        relay.handle(peer.conn, ClientEvent::Ping {}).await.unwrap();
        assert_eq!(peer.drain(), vec![ServerEvent::Pong {}]);
    }

    #[tokio::test]
    async fn test_room_order_is_shared_by_all_peers() {
        let (relay, _, code) = setup().await;
        let mut host = joined(&relay, &code, "host", true).await;
        let mut student = joined(&relay, &code, "s1", false).await;
        host.drain();

        let mut tasks = Vec::new();
        for (conn, tag) in [(host.conn, "h"), (student.conn, "s")] {
            let relay = relay.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    relay
                        .handle(conn, ClientEvent::ChatMessage { message: format!("{}{}", tag, i) })
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let order = |events: Vec<ServerEvent>| -> Vec<Uuid> {
            events
                .into_iter()
                .filter_map(|e| match e {
                    ServerEvent::ChatMessage(m) => Some(m.id),
                    _ => None,
                })
                .collect()
        };
        let seen_by_host = order(host.drain());
        let seen_by_student = order(student.drain());
        assert_eq!(seen_by_host.len(), 100);
        assert_eq!(seen_by_host, seen_by_student);
    }
}
