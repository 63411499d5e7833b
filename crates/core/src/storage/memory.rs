//! In-memory course store

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use super::{CourseStore, SessionFilter};
use crate::error::StoreError;
use crate::models::{Session, SessionId, SessionPatch};

#[derive(Debug, Default)]
pub struct MemoryCourseStore {
    courses: RwLock<HashMap<SessionId, Session>>,
}

impl MemoryCourseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CourseStore for MemoryCourseStore {
    fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Ok(self.courses.read().get(id).cloned())
    }

    fn create(&self, session: &Session) -> Result<(), StoreError> {
        let mut courses = self.courses.write();
        if courses.contains_key(&session.id) {
            return Err(StoreError::Duplicate(session.id.to_string()));
        }
        courses.insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, "Course stored");
        Ok(())
    }

    fn update(&self, id: &SessionId, patch: &SessionPatch) -> Result<Session, StoreError> {
        let mut courses = self.courses.write();
        let session = courses
            .get_mut(id)
            .ok_or_else(|| StoreError::Missing(id.to_string()))?;
        session.apply(patch);
        Ok(session.clone())
    }

    fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<_> = self
            .courses
            .read()
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(sessions)
    }
}
