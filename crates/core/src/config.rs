//! Tunables for the coordination core
//!
//! Every section deserializes with defaults so a partial TOML table is
//! enough.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long before `scheduledAt` a course may be started
    pub start_lead_minutes: i64,
    /// Reject early starts; disabled for local testing
    pub enforce_schedule: bool,
    /// Upper bound on any router or recorder call
    pub dependency_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_lead_minutes: 10,
            enforce_schedule: true,
            dependency_timeout_ms: 5_000,
        }
    }
}

impl LifecycleConfig {
    pub fn start_lead(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.start_lead_minutes)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }
}

/// In-process media router settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Address advertised in ICE candidates
    pub announced_ip: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            announced_ip: "127.0.0.1".to_string(),
            rtc_min_port: 40_000,
            rtc_max_port: 49_999,
        }
    }
}

/// ffmpeg recorder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Root directory; `active/`, `completed/` and `failed/` live below it
    pub directory: PathBuf,
    /// Public prefix for finished recording URLs
    pub base_url: String,
    pub ffmpeg_path: PathBuf,
    /// Input arguments placed before the output options
    pub input_args: Vec<String>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("recordings"),
            base_url: "http://localhost:3000".to_string(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            input_args: [
                "-f",
                "lavfi",
                "-i",
                "testsrc2=size=1280x720:rate=30",
                "-f",
                "lavfi",
                "-i",
                "sine=frequency=440:sample_rate=48000",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl RecordingConfig {
    pub fn active_dir(&self) -> PathBuf {
        self.directory.join("active")
    }

    pub fn completed_dir(&self) -> PathBuf {
        self.directory.join("completed")
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.directory.join("failed")
    }

    /// Public URL of a finished recording
    pub fn public_url(&self, file_name: &str) -> String {
        format!(
            "{}/recordings/completed/{}",
            self.base_url.trim_end_matches('/'),
            file_name
        )
    }
}
