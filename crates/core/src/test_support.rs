//! Fakes for the external collaborators
//!
//! Each fake counts calls and can be told to fail or stall, so tests can
//! check how often the core reached out and how it copes with trouble.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::error::{DependencyError, RecorderError, StoreError};
use crate::media::{MediaRouter, RouterHandle, TransportDescriptor};
use crate::models::{Session, SessionId, SessionPatch};
use crate::recording::{Recorder, RecordingArtifact, RecordingMetadata};
use crate::storage::{CourseStore, MemoryCourseStore, SessionFilter};

#[derive(Debug, Default)]
struct RouterCounters {
    allocations: AtomicUsize,
    closes: AtomicUsize,
    transports: AtomicUsize,
}

/// Media router that allocates inert routers
#[derive(Debug, Default)]
pub struct FakeMediaRouter {
    counters: Arc<RouterCounters>,
    fail: AtomicBool,
    stall: Mutex<Option<Duration>>,
}

impl FakeMediaRouter {
    pub fn allocations(&self) -> usize {
        self.counters.allocations.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> usize {
        self.counters.transports.load(Ordering::SeqCst)
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn stall_allocations(&self, by: Duration) {
        *self.stall.lock() = Some(by);
    }
}

#[async_trait]
impl MediaRouter for FakeMediaRouter {
    async fn allocate_router(&self) -> Result<Arc<dyn RouterHandle>, DependencyError> {
        let stall = *self.stall.lock();
        if let Some(by) = stall {
            tokio::time::sleep(by).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DependencyError::RouterAllocation("fake router refused".into()));
        }
        let n = self.counters.allocations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(FakeRouter {
            id: format!("router-{}", n),
            counters: self.counters.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct FakeRouter {
    id: String,
    counters: Arc<RouterCounters>,
    closed: AtomicBool,
}

#[async_trait]
impl RouterHandle for FakeRouter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_transport(&self) -> Result<TransportDescriptor, DependencyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DependencyError::Transport("closed".into()));
        }
        let n = self.counters.transports.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TransportDescriptor {
            transport_id: format!("{}-transport-{}", self.id, n),
            ice_parameters: json!({}),
            ice_candidates: json!([]),
            dtls_parameters: json!({}),
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Snapshot of recorder call counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderCalls {
    pub start: usize,
    pub pause: usize,
    pub resume: usize,
    pub stop: usize,
    pub discard: usize,
}

/// Recorder that only counts
#[derive(Debug, Default)]
pub struct FakeRecorder {
    calls: Mutex<RecorderCalls>,
    fail: AtomicBool,
    stall: Mutex<Option<Duration>>,
}

impl FakeRecorder {
    pub fn calls(&self) -> RecorderCalls {
        *self.calls.lock()
    }

    pub fn fail_with(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn stall_for(&self, by: Duration) {
        *self.stall.lock() = Some(by);
    }

    async fn call(&self, count: impl FnOnce(&mut RecorderCalls)) -> Result<(), RecorderError> {
        count(&mut self.calls.lock());
        let stall = *self.stall.lock();
        if let Some(by) = stall {
            tokio::time::sleep(by).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RecorderError::Process("fake encoder crashed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Recorder for FakeRecorder {
    async fn start(
        &self,
        session_id: &SessionId,
        _metadata: &RecordingMetadata,
    ) -> Result<String, RecorderError> {
        self.call(|c| c.start += 1).await?;
        Ok(format!("course-{}.mp4", session_id))
    }

    async fn pause(&self, _session_id: &SessionId) -> Result<(), RecorderError> {
        self.call(|c| c.pause += 1).await
    }

    async fn resume(&self, _session_id: &SessionId) -> Result<(), RecorderError> {
        self.call(|c| c.resume += 1).await
    }

    async fn stop(&self, session_id: &SessionId) -> Result<RecordingArtifact, RecorderError> {
        self.call(|c| c.stop += 1).await?;
        Ok(RecordingArtifact {
            duration_seconds: 42,
            size_bytes: 1024,
            url: format!(
                "http://localhost:3000/recordings/completed/course-{}.mp4",
                session_id
            ),
        })
    }

    async fn discard(&self, _session_id: &SessionId) -> Result<(), RecorderError> {
        self.call(|c| c.discard += 1).await
    }
}

/// In-memory store whose writes can be switched off
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryCourseStore,
    fail_updates: AtomicBool,
}

impl FlakyStore {
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

impl CourseStore for FlakyStore {
    fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.inner.get(id)
    }

    fn create(&self, session: &Session) -> Result<(), StoreError> {
        self.inner.create(session)
    }

    fn update(&self, id: &SessionId, patch: &SessionPatch) -> Result<Session, StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("fake outage".into()));
        }
        self.inner.update(id, patch)
    }

    fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, StoreError> {
        self.inner.list(filter)
    }
}
