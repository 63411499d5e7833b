//! Session management request handling

use serde::Serialize;
use tracing::{info, warn};

use livecourse_core::{Error as CoreError, SessionLifecycle, StartOptions};

use crate::protocol::{ControlFailure, ControlRequest, ControlResponse};

fn respond<T: Serialize>(message: impl Into<String>, data: &T) -> ControlResponse {
    match serde_json::to_value(data) {
        Ok(value) => ControlResponse::ok(message, value),
        Err(e) => ControlResponse::failed(ControlFailure {
            kind: "internal".into(),
            message: format!("Failed to encode response: {}", e),
            can_start_at: None,
        }),
    }
}

fn failure(action: &'static str, err: &CoreError) -> ControlResponse {
    if err.kind().is_business() {
        info!(action, code = err.code(), error = %err, "Request refused");
    } else {
        warn!(action, code = err.code(), error = %err, "Request failed");
    }
    ControlResponse::failed(ControlFailure::from(err))
}

/// Run one control request against the lifecycle
pub async fn handle_request(lifecycle: &SessionLifecycle, request: ControlRequest) -> ControlResponse {
    let action = request.action();
    let result = match request {
        ControlRequest::CreateSession(new) => lifecycle
            .create_session(new)
            .map(|s| respond("Live course created successfully", &s)),
        ControlRequest::GetSession(r) => lifecycle
            .get(&r.session_id)
            .map(|s| respond("Course retrieved", &s)),
        ControlRequest::ListSessions(filter) => lifecycle.list(&filter).map(|sessions| {
            respond(
                format!("Found {} courses", sessions.len()),
                &serde_json::json!({ "courses": sessions, "count": sessions.len() }),
            )
        }),
        ControlRequest::StartSession(start) => lifecycle
            .start(&start.session_id, StartOptions { force: start.force })
            .await
            .map(|o| respond(o.message.clone(), &o)),
        ControlRequest::LeaveSession(r) => lifecycle
            .pause(&r.session_id)
            .await
            .map(|o| respond(o.message.clone(), &o)),
        ControlRequest::ResumeSession(r) => lifecycle
            .resume(&r.session_id)
            .await
            .map(|o| respond(o.message.clone(), &o)),
        ControlRequest::CompleteSession(r) => lifecycle
            .complete(&r.session_id)
            .await
            .map(|o| respond(o.message.clone(), &o)),
        ControlRequest::JoinSession(join) => {
            lifecycle
                .join(&join.session_id, &join.user_id)
                .await
                .map(|j| {
                    let message = if j.already_joined {
                        "User is already joined to this course"
                    } else {
                        "User successfully joined the live course"
                    };
                    respond(message, &j)
                })
        }
        ControlRequest::SessionStatus(r) => lifecycle
            .status(&r.session_id)
            .map(|report| respond("Course status retrieved", &report)),
    };

    match result {
        Ok(response) => {
            info!(action, "Request handled");
            response
        }
        Err(e) => failure(action, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JoinSession, SessionRef, StartSession};
    use chrono::{Duration as ChronoDuration, Utc};
    use livecourse_core::test_support::{FakeMediaRouter, FakeRecorder};
    use livecourse_core::{
        LifecycleConfig, MemoryCourseStore, NewSession, RecordingCoordinator, RoomRegistry,
        SessionId,
    };
    use std::sync::Arc;
    use std::time::Duration;

    fn lifecycle() -> SessionLifecycle {
        let timeout = Duration::from_millis(200);
        SessionLifecycle::new(
            Arc::new(MemoryCourseStore::new()),
            Arc::new(RoomRegistry::new(Arc::new(FakeMediaRouter::default()), timeout)),
            Arc::new(RecordingCoordinator::new(Arc::new(FakeRecorder::default()), timeout)),
            LifecycleConfig::default(),
        )
    }

    fn create(scheduled_in: ChronoDuration) -> ControlRequest {
        ControlRequest::CreateSession(NewSession {
            name: "Beauty Basics Course".into(),
            category: "beauty".into(),
            instructor_id: "instructor_456".into(),
            instructor_name: "Jane Doe".into(),
            scheduled_at: Some(Utc::now() + scheduled_in),
            ..Default::default()
        })
    }

    fn session_ref(id: &SessionId) -> SessionRef {
        SessionRef {
            session_id: id.clone(),
        }
    }

    async fn created(lc: &SessionLifecycle, scheduled_in: ChronoDuration) -> SessionId {
        let response = handle_request(lc, create(scheduled_in)).await;
        assert!(response.success, "{:?}", response);
        let data = response.data.unwrap();
        SessionId::from(data["id"].as_str().unwrap())
    }

    #[tokio::test]
    async fn test_course_walkthrough() {
        let lc = lifecycle();
        let id = created(&lc, ChronoDuration::minutes(5)).await;

        let started = handle_request(
            &lc,
            ControlRequest::StartSession(StartSession {
                session_id: id.clone(),
                force: false,
            }),
        )
        .await;
        assert!(started.success);
        assert_eq!(started.message, "Live course started successfully");
        let data = started.data.unwrap();
        assert_eq!(data["session"]["status"], "active");
        assert_eq!(data["session"]["roomCode"].as_str().unwrap().len(), 6);
        assert_eq!(data["recordingActive"], true);

        let left = handle_request(&lc, ControlRequest::LeaveSession(session_ref(&id))).await;
        assert_eq!(
            left.message,
            "Host left the live course successfully. Session paused."
        );

        let resumed = handle_request(
            &lc,
            ControlRequest::StartSession(StartSession {
                session_id: id.clone(),
                force: false,
            }),
        )
        .await;
        assert_eq!(resumed.message, "Host rejoined successfully. Course resumed.");
        assert_eq!(resumed.data.unwrap()["resumed"], true);

        let done = handle_request(&lc, ControlRequest::CompleteSession(session_ref(&id))).await;
        assert!(done.success);
        assert!(done.data.unwrap()["session"]["roomCode"].is_null());

        let again = handle_request(&lc, ControlRequest::CompleteSession(session_ref(&id))).await;
        assert!(!again.success);
        assert_eq!(again.error.unwrap().kind, "already-completed");
    }

    #[tokio::test]
    async fn test_too_early_reports_start_time() {
        let lc = lifecycle();
        let id = created(&lc, ChronoDuration::minutes(20)).await;

        let response = handle_request(
            &lc,
            ControlRequest::StartSession(StartSession {
                session_id: id,
                force: false,
            }),
        )
        .await;
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "too-early");
        assert!(error.can_start_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_join_messages() {
        let lc = lifecycle();
        let id = created(&lc, ChronoDuration::zero()).await;
        let join = || {
            ControlRequest::JoinSession(JoinSession {
                session_id: id.clone(),
                user_id: "user1".into(),
            })
        };

        let first = handle_request(&lc, join()).await;
        assert_eq!(first.message, "User successfully joined the live course");
        let second = handle_request(&lc, join()).await;
        assert_eq!(second.message, "User is already joined to this course");
        assert_eq!(second.data.unwrap()["totalJoinedUsers"], 1);
    }

    #[tokio::test]
    async fn test_missing_fields_and_unknown_course() {
        let lc = lifecycle();
        let response = handle_request(
            &lc,
            ControlRequest::CreateSession(NewSession {
                name: "Nameless".into(),
                ..Default::default()
            }),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, "invalid-input");
        assert!(error.message.contains("instructorId"));

        let response = handle_request(
            &lc,
            ControlRequest::SessionStatus(session_ref(&SessionId::from("nope"))),
        )
        .await;
        assert_eq!(response.error.unwrap().kind, "not-found");
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let lc = lifecycle();
        created(&lc, ChronoDuration::zero()).await;
        created(&lc, ChronoDuration::hours(1)).await;

        let response = handle_request(&lc, ControlRequest::ListSessions(Default::default())).await;
        assert_eq!(response.message, "Found 2 courses");
        assert_eq!(response.data.unwrap()["count"], 2);
    }
}
