use crate::retry::BoundedRetry;
use serde::Deserialize;
use std::time::Duration;

/// Runtime configuration; deserializable from TOML.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RuntimeConfig {
    #[serde(default = "crate::config::defaults::default_log_level")]
    pub log_level: LogLevel,
    #[serde(default = "crate::config::defaults::default_settings_path")]
    pub settings_path: String,
    #[serde(default = "crate::config::defaults::default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "crate::config::defaults::default_worker_mode")]
    pub worker_mode: WorkerMode,
    #[serde(default = "crate::config::defaults::default_model_path")]
    pub model_path: String,
    #[serde(default = "crate::config::defaults::default_espeak_path")]
    pub espeak_path: String,
    #[serde(default = "crate::config::defaults::default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,
    #[serde(default = "crate::config::defaults::default_worker_ready_max_attempts")]
    pub worker_ready_max_attempts: u32,
    #[serde(default = "crate::config::defaults::default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
    #[serde(default = "crate::config::defaults::default_streaming_threshold_chars")]
    pub streaming_threshold_chars: usize,
    #[serde(default = "crate::config::defaults::default_preview_timeout_secs")]
    pub preview_timeout_secs: u64,
    #[serde(default)]
    pub prewarm_local_model: bool,
    #[serde(default = "crate::config::defaults::default_native_speech_program")]
    pub native_speech_program: String,
    #[serde(default = "crate::config::defaults::default_max_page_chars")]
    pub max_page_chars: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        use crate::config::defaults::*;
        RuntimeConfig {
            log_level: default_log_level(),
            settings_path: default_settings_path(),
            api_base_url: default_api_base_url(),
            worker_mode: default_worker_mode(),
            model_path: default_model_path(),
            espeak_path: default_espeak_path(),
            worker_poll_interval_ms: default_worker_poll_interval_ms(),
            worker_ready_max_attempts: default_worker_ready_max_attempts(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
            streaming_threshold_chars: default_streaming_threshold_chars(),
            preview_timeout_secs: default_preview_timeout_secs(),
            prewarm_local_model: false,
            native_speech_program: default_native_speech_program(),
            max_page_chars: default_max_page_chars(),
        }
    }
}

impl RuntimeConfig {
    pub fn worker_timings(&self) -> WorkerTimings {
        WorkerTimings {
            readiness: BoundedRetry::new(
                Duration::from_millis(self.worker_poll_interval_ms.max(1)),
                self.worker_ready_max_attempts.max(1),
            ),
            preview_timeout: Duration::from_secs(self.preview_timeout_secs.max(1)),
        }
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms.max(1))
    }
}

/// Polling budgets shared by the worker manager and the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTimings {
    /// Readiness polling for a freshly created worker, and for callers that
    /// wait on an initialisation already in flight.
    pub readiness: BoundedRetry,
    /// How long a voice preview waits for the worker's audio.
    pub preview_timeout: Duration,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        RuntimeConfig::default().worker_timings()
    }
}

/// Where the local model worker runs.
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerMode {
    /// A child process of the reader binary speaking JSON lines.
    Process,
    /// A task inside the coordinator's runtime.
    InProcess,
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Deserialize, serde::Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
