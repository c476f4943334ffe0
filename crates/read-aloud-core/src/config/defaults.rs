use super::models::{LogLevel, WorkerMode};

pub(crate) fn default_log_level() -> LogLevel {
    LogLevel::Info
}

pub(crate) fn default_settings_path() -> String {
    ".cache/settings.json".to_string()
}

pub(crate) fn default_api_base_url() -> String {
    "https://api.elevenlabs.io/v1".to_string()
}

pub(crate) fn default_worker_mode() -> WorkerMode {
    WorkerMode::Process
}

pub(crate) fn default_model_path() -> String {
    "/usr/share/piper-voices/en/en_US/ryan/high/en_US-ryan-high.onnx".to_string()
}

pub(crate) fn default_espeak_path() -> String {
    "/usr/share".to_string()
}

pub(crate) fn default_worker_poll_interval_ms() -> u64 {
    100
}

/// 300 polls at the default interval covers a first-run model download.
pub(crate) fn default_worker_ready_max_attempts() -> u32 {
    300
}

pub(crate) fn default_drain_poll_interval_ms() -> u64 {
    50
}

pub(crate) fn default_streaming_threshold_chars() -> usize {
    100
}

pub(crate) fn default_preview_timeout_secs() -> u64 {
    60
}

pub(crate) fn default_native_speech_program() -> String {
    if cfg!(target_os = "macos") {
        "say".to_string()
    } else {
        "espeak-ng".to_string()
    }
}

pub(crate) fn default_max_page_chars() -> usize {
    5000
}

// User settings defaults.

pub(crate) fn default_voice_id() -> String {
    "EXAVITQu4vr4xnSDxMaL".to_string()
}

pub(crate) fn default_local_voice_id() -> String {
    "af_heart".to_string()
}

pub(crate) fn default_model_id() -> String {
    "eleven_multilingual_v2".to_string()
}

pub(crate) fn default_stability() -> f32 {
    0.5
}

pub(crate) fn default_similarity_boost() -> f32 {
    0.75
}

pub(crate) fn default_speed() -> f32 {
    1.0
}

pub(crate) fn default_auto_read_delay_ms() -> u64 {
    1000
}

pub(crate) fn default_native_rate() -> f32 {
    1.0
}
