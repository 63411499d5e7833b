//! Course storage
//!
//! [`CourseStore`] is the durable home of session documents. The backend is
//! chosen once at startup: [`MemoryCourseStore`] for tests and throwaway
//! runs, [`SqliteCourseStore`] otherwise.

mod memory;
mod migrations;
mod parse;
mod sqlite;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::{Session, SessionId, SessionPatch, SessionStatus};

pub use memory::MemoryCourseStore;
pub use sqlite::SqliteCourseStore;

/// Course repository operations
pub trait CourseStore: Send + Sync {
    /// Find a course by id
    fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Insert a new course; fails with `Duplicate` if the id exists
    fn create(&self, session: &Session) -> Result<(), StoreError>;

    /// Apply a partial update and return the stored result
    fn update(&self, id: &SessionId, patch: &SessionPatch) -> Result<Session, StoreError>;

    /// Courses matching a filter, ordered by schedule
    fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError>;
}

/// Optional constraints for [`CourseStore::list`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub instructor_id: Option<String>,
    pub category: Option<String>,
}

impl SessionFilter {
    pub fn matches(&self, session: &Session) -> bool {
        self.status.map_or(true, |s| session.status == s)
            && self
                .instructor_id
                .as_deref()
                .map_or(true, |i| session.instructor_id == i)
            && self
                .category
                .as_deref()
                .map_or(true, |c| session.category == c)
    }
}
