//! SQLite course store

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::instrument;

use super::migrations;
use super::parse::{is_constraint_violation, parse_session, OptionalExt};
use super::{CourseStore, SessionFilter};
use crate::error::StoreError;
use crate::models::{Session, SessionId, SessionPatch};

/// Fixed-width timestamps so the text column sorts chronologically
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Course store backed by a single SQLite connection
pub struct SqliteCourseStore {
    conn: Mutex<Connection>,
}

impl SqliteCourseStore {
    /// Open or create database at the given path
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open in-memory database (for testing)
    #[instrument]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get current schema version
    pub fn schema_version(&self) -> u32 {
        migrations::get_current_version(&self.conn.lock()).unwrap_or(0)
    }

    fn read(conn: &Connection, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let session = conn
            .query_row(
                "SELECT body FROM courses WHERE id = ?1",
                params![id.as_str()],
                |row| parse_session(0, &row.get::<_, String>(0)?),
            )
            .optional()?;
        Ok(session)
    }

    fn write(conn: &Connection, session: &Session) -> Result<(), StoreError> {
        let body = serde_json::to_string(session)?;
        conn.execute(
            "UPDATE courses SET status = ?1, scheduled_at = ?2, body = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                session.status.as_str(),
                timestamp(session.scheduled_at),
                body,
                timestamp(session.updated_at),
                session.id.as_str(),
            ],
        )?;
        Ok(())
    }
}

impl CourseStore for SqliteCourseStore {
    #[instrument(skip(self), fields(session_id = %id))]
    fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        Self::read(&self.conn.lock(), id)
    }

    #[instrument(skip(self, session), fields(session_id = %session.id))]
    fn create(&self, session: &Session) -> Result<(), StoreError> {
        let body = serde_json::to_string(session)?;
        let result = self.conn.lock().execute(
            "INSERT INTO courses (id, status, scheduled_at, instructor_id, category, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session.id.as_str(),
                session.status.as_str(),
                timestamp(session.scheduled_at),
                session.instructor_id,
                session.category,
                body,
                timestamp(session.created_at),
                timestamp(session.updated_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                Err(StoreError::Duplicate(session.id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, patch), fields(session_id = %id))]
    fn update(&self, id: &SessionId, patch: &SessionPatch) -> Result<Session, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut session =
            Self::read(&tx, id)?.ok_or_else(|| StoreError::Missing(id.to_string()))?;
        session.apply(patch);
        Self::write(&tx, &session)?;
        tx.commit()?;
        Ok(session)
    }

    #[instrument(skip(self))]
    fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT body FROM courses
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR instructor_id = ?2)
               AND (?3 IS NULL OR category = ?3)
             ORDER BY scheduled_at, id",
        )?;

        let sessions = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.instructor_id,
                    filter.category,
                ],
                |row| parse_session(0, &row.get::<_, String>(0)?),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sessions)
    }
}
