//! ffmpeg-backed recorder
//!
//! Each recording is owned by a supervisor task that receives commands over
//! a channel and answers on a oneshot. Pausing closes the current segment,
//! resuming opens a new one, and stopping concatenates the segments into
//! `<dir>/completed/<file>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{Recorder, RecordingArtifact, RecordingMetadata};
use crate::config::RecordingConfig;
use crate::error::RecorderError;
use crate::models::SessionId;

/// How long ffmpeg gets to flush after being asked to quit
const QUIT_GRACE: Duration = Duration::from_secs(10);

const OUTPUT_ARGS: &[&str] = &[
    "-c:v",
    "libx264",
    "-preset",
    "veryfast",
    "-pix_fmt",
    "yuv420p",
    "-c:a",
    "aac",
    "-movflags",
    "+faststart",
    "-y",
];

type Ack<T> = oneshot::Sender<Result<T, RecorderError>>;

enum SupervisorCommand {
    Pause(Ack<()>),
    Resume(Ack<()>),
    Stop(Ack<RecordingArtifact>),
    Discard(Ack<()>),
}

/// `course-<sessionId>-<unix millis>.mp4`
pub fn recording_file_name(session_id: &SessionId, at: DateTime<Utc>) -> String {
    format!("course-{}-{}.mp4", session_id, at.timestamp_millis())
}

fn segment_name(file_name: &str, index: usize) -> String {
    let stem = file_name.strip_suffix(".mp4").unwrap_or(file_name);
    format!("{}.part{}.mp4", stem, index)
}

fn encoder_args(input_args: &[String], output: &Path) -> Vec<String> {
    let mut args: Vec<String> = input_args.to_vec();
    args.extend(OUTPUT_ARGS.iter().map(|s| s.to_string()));
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Body of an ffmpeg concat demuxer list
fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .filter_map(|p| p.file_name())
        .map(|name| {
            let name = name.to_string_lossy().replace('\'', "'\\''");
            format!("file '{}'\n", name)
        })
        .collect()
}

/// Recorder that runs one ffmpeg supervisor per session
pub struct FfmpegRecorder {
    config: Arc<RecordingConfig>,
    supervisors: Mutex<HashMap<SessionId, mpsc::Sender<SupervisorCommand>>>,
}

impl FfmpegRecorder {
    pub fn new(config: RecordingConfig) -> Self {
        Self {
            config: Arc::new(config),
            supervisors: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, session_id: &SessionId) -> Result<mpsc::Sender<SupervisorCommand>, RecorderError> {
        self.supervisors
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RecorderError::NoActiveRecording(session_id.to_string()))
    }

    fn take_sender(
        &self,
        session_id: &SessionId,
    ) -> Result<mpsc::Sender<SupervisorCommand>, RecorderError> {
        self.supervisors
            .lock()
            .remove(session_id)
            .ok_or_else(|| RecorderError::NoActiveRecording(session_id.to_string()))
    }

    async fn request<T>(
        tx: &mpsc::Sender<SupervisorCommand>,
        make: impl FnOnce(Ack<T>) -> SupervisorCommand,
    ) -> Result<T, RecorderError> {
        let (ack, reply) = oneshot::channel();
        tx.send(make(ack))
            .await
            .map_err(|_| RecorderError::SupervisorGone)?;
        reply.await.map_err(|_| RecorderError::SupervisorGone)?
    }
}

#[async_trait]
impl Recorder for FfmpegRecorder {
    async fn start(
        &self,
        session_id: &SessionId,
        metadata: &RecordingMetadata,
    ) -> Result<String, RecorderError> {
        if self.supervisors.lock().contains_key(session_id) {
            return Err(RecorderError::AlreadyRecording(session_id.to_string()));
        }

        for dir in [
            self.config.active_dir(),
            self.config.completed_dir(),
            self.config.failed_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let file_name = recording_file_name(session_id, Utc::now());
        let mut supervisor = Supervisor::new(self.config.clone(), session_id.clone(), file_name.clone());
        supervisor.open_segment().await?;

        let (tx, rx) = mpsc::channel(8);
        let raced = {
            let mut supervisors = self.supervisors.lock();
            if supervisors.contains_key(session_id) {
                true
            } else {
                supervisors.insert(session_id.clone(), tx);
                false
            }
        };
        if raced {
            supervisor.discard().await;
            return Err(RecorderError::AlreadyRecording(session_id.to_string()));
        }
        tokio::spawn(supervisor.run(rx));

        info!(
            session_id = %session_id,
            file = %file_name,
            course = %metadata.course_name,
            instructor = %metadata.instructor_name,
            "ffmpeg recording started"
        );
        Ok(file_name)
    }

    async fn pause(&self, session_id: &SessionId) -> Result<(), RecorderError> {
        let tx = self.sender(session_id)?;
        Self::request(&tx, SupervisorCommand::Pause).await
    }

    async fn resume(&self, session_id: &SessionId) -> Result<(), RecorderError> {
        let tx = self.sender(session_id)?;
        Self::request(&tx, SupervisorCommand::Resume).await
    }

    async fn stop(&self, session_id: &SessionId) -> Result<RecordingArtifact, RecorderError> {
        let tx = self.take_sender(session_id)?;
        Self::request(&tx, SupervisorCommand::Stop).await
    }

    async fn discard(&self, session_id: &SessionId) -> Result<(), RecorderError> {
        let tx = self.take_sender(session_id)?;
        Self::request(&tx, SupervisorCommand::Discard).await
    }
}

/// Owns the ffmpeg child and the segment files of one recording
struct Supervisor {
    config: Arc<RecordingConfig>,
    session_id: SessionId,
    file_name: String,
    segments: Vec<PathBuf>,
    child: Option<Child>,
    segment_started: Option<Instant>,
    recorded: Duration,
}

impl Supervisor {
    fn new(config: Arc<RecordingConfig>, session_id: SessionId, file_name: String) -> Self {
        Self {
            config,
            session_id,
            file_name,
            segments: Vec::new(),
            child: None,
            segment_started: None,
            recorded: Duration::ZERO,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SupervisorCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                SupervisorCommand::Pause(ack) => {
                    let result = if self.child.is_some() {
                        self.close_segment().await
                    } else {
                        Err(RecorderError::WrongState {
                            expected: "recording",
                            actual: "paused",
                        })
                    };
                    let _ = ack.send(result);
                }
                SupervisorCommand::Resume(ack) => {
                    let result = if self.child.is_none() {
                        self.open_segment().await
                    } else {
                        Err(RecorderError::WrongState {
                            expected: "paused",
                            actual: "recording",
                        })
                    };
                    let _ = ack.send(result);
                }
                SupervisorCommand::Stop(ack) => {
                    let result = self.finish().await;
                    if let Err(e) = &result {
                        error!(session_id = %self.session_id, error = %e, "Failed to finalize recording");
                    }
                    let _ = ack.send(result);
                    return;
                }
                SupervisorCommand::Discard(ack) => {
                    self.discard().await;
                    let _ = ack.send(Ok(()));
                    return;
                }
            }
        }

        warn!(session_id = %self.session_id, "Recorder dropped without stop, discarding");
        self.discard().await;
    }

    async fn open_segment(&mut self) -> Result<(), RecorderError> {
        let path = self
            .config
            .active_dir()
            .join(segment_name(&self.file_name, self.segments.len()));

        let child = Command::new(&self.config.ffmpeg_path)
            .args(encoder_args(&self.config.input_args, &path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RecorderError::Process(format!("failed to start ffmpeg: {}", e)))?;

        debug!(session_id = %self.session_id, segment = %path.display(), "Segment opened");
        self.segments.push(path);
        self.child = Some(child);
        self.segment_started = Some(Instant::now());
        Ok(())
    }

    /// Ask ffmpeg to quit and wait for it to flush the segment
    async fn close_segment(&mut self) -> Result<(), RecorderError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Some(started) = self.segment_started.take() {
            self.recorded += started.elapsed();
        }

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(b"q").await {
                debug!(session_id = %self.session_id, error = %e, "ffmpeg stdin already closed");
            }
        }

        match tokio::time::timeout(QUIT_GRACE, child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                warn!(session_id = %self.session_id, %status, "ffmpeg exited with failure");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!(session_id = %self.session_id, "ffmpeg ignored quit, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }

    async fn existing_segments(&self) -> Vec<PathBuf> {
        let mut existing = Vec::new();
        for segment in &self.segments {
            if tokio::fs::metadata(segment).await.is_ok() {
                existing.push(segment.clone());
            }
        }
        existing
    }

    async fn finish(&mut self) -> Result<RecordingArtifact, RecorderError> {
        self.close_segment().await?;

        let segments = self.existing_segments().await;
        let output = self.config.completed_dir().join(&self.file_name);

        match segments.as_slice() {
            [] => {
                return Err(RecorderError::Process(format!(
                    "no segments written for {}",
                    self.file_name
                )))
            }
            [single] => tokio::fs::rename(single, &output).await?,
            _ => {
                if let Err(e) = self.concat(&segments, &output).await {
                    self.move_to_failed(&segments).await;
                    return Err(e);
                }
            }
        }

        let size_bytes = tokio::fs::metadata(&output).await?.len();
        info!(
            session_id = %self.session_id,
            file = %output.display(),
            segments = segments.len(),
            size_bytes,
            "Recording finalized"
        );

        Ok(RecordingArtifact {
            duration_seconds: self.recorded.as_secs(),
            size_bytes,
            url: self.config.public_url(&self.file_name),
        })
    }

    async fn concat(&self, segments: &[PathBuf], output: &Path) -> Result<(), RecorderError> {
        let list_path = self
            .config
            .active_dir()
            .join(format!("{}.txt", self.file_name));
        tokio::fs::write(&list_path, concat_list(segments)).await?;

        let status = Command::new(&self.config.ffmpeg_path)
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(&list_path)
            .args(["-c", "copy", "-y"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        let _ = tokio::fs::remove_file(&list_path).await;
        let status = status?;
        if !status.success() {
            return Err(RecorderError::Process(format!(
                "ffmpeg concat exited with {}",
                status
            )));
        }

        for segment in segments {
            let _ = tokio::fs::remove_file(segment).await;
        }
        Ok(())
    }

    async fn move_to_failed(&self, segments: &[PathBuf]) {
        let failed = self.config.failed_dir();
        for segment in segments {
            if let Some(name) = segment.file_name() {
                if let Err(e) = tokio::fs::rename(segment, failed.join(name)).await {
                    warn!(segment = %segment.display(), error = %e, "Failed to move segment");
                }
            }
        }
    }

    async fn discard(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        for segment in self.segments.drain(..) {
            if let Err(e) = tokio::fs::remove_file(&segment).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(segment = %segment.display(), error = %e, "Failed to delete segment");
                }
            }
        }
        info!(session_id = %self.session_id, file = %self.file_name, "Recording discarded");
    }
}
