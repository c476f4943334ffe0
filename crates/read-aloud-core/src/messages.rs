//! Wire types exchanged between the coordinator, pages and the worker.
//!
//! Every enum is tagged by `action` (or `kind` for the process transport) in
//! kebab-case, and the inbound ones carry an `unknown` catch-all so a peer
//! running a newer protocol never takes a context down.

use crate::engine::EngineKind;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    #[serde(rename = "audio/mpeg")]
    Mpeg,
    #[serde(rename = "audio/wav")]
    Wav,
}

impl AudioFormat {
    pub fn mime(self) -> &'static str {
        match self {
            AudioFormat::Mpeg => "audio/mpeg",
            AudioFormat::Wav => "audio/wav",
        }
    }
}

/// Compressed audio as produced by an engine; bytes travel as base64.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedAudio {
    pub format: AudioFormat,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl EncodedAudio {
    pub fn new(format: AudioFormat, bytes: Vec<u8>) -> Self {
        Self { format, bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for EncodedAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedAudio")
            .field("format", &self.format.mime())
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Position of a chunk inside a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub is_first: bool,
    pub is_final: bool,
}

/// Where a read request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadOrigin {
    ContextMenu,
    Shortcut,
    AutoRead,
    Page,
    Popup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
}

/// Progress phases reported while the local model loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadStatus {
    Downloading,
    Loading,
    Ready,
    Error,
}

/// Coordinator to page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum PageMessage {
    StartLoading {
        engine: EngineKind,
        message: String,
    },
    EngineSelected {
        engine: EngineKind,
    },
    PlayAudio {
        request_id: RequestId,
        audio: EncodedAudio,
    },
    PlayAudioChunk {
        request_id: RequestId,
        audio: EncodedAudio,
        chunk: ChunkInfo,
    },
    StreamEnd {
        request_id: RequestId,
    },
    SpeakWithNative {
        request_id: RequestId,
        text: String,
        voice: Option<String>,
        rate: f32,
    },
    StopAudio,
    PauseAudio,
    ResumeAudio,
    UpdateLoadingStatus {
        engine: EngineKind,
        status: LoadStatus,
        message: String,
        progress: Option<f32>,
    },
    AutoReadChanged {
        enabled: bool,
    },
    GetSelection,
    ReadPageContent,
    Notice {
        message: String,
    },
    Error {
        kind: String,
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl PageMessage {
    pub fn action(&self) -> &'static str {
        match self {
            PageMessage::StartLoading { .. } => "start-loading",
            PageMessage::EngineSelected { .. } => "engine-selected",
            PageMessage::PlayAudio { .. } => "play-audio",
            PageMessage::PlayAudioChunk { .. } => "play-audio-chunk",
            PageMessage::StreamEnd { .. } => "stream-end",
            PageMessage::SpeakWithNative { .. } => "speak-with-native",
            PageMessage::StopAudio => "stop-audio",
            PageMessage::PauseAudio => "pause-audio",
            PageMessage::ResumeAudio => "resume-audio",
            PageMessage::UpdateLoadingStatus { .. } => "update-loading-status",
            PageMessage::AutoReadChanged { .. } => "auto-read-changed",
            PageMessage::GetSelection => "get-selection",
            PageMessage::ReadPageContent => "read-page-content",
            PageMessage::Notice { .. } => "notice",
            PageMessage::Error { .. } => "error",
            PageMessage::Unknown => "unknown",
        }
    }

    pub fn error(err: &crate::error::ReadError) -> Self {
        PageMessage::Error {
            kind: err.kind().to_string(),
            message: err.user_message(),
        }
    }
}

/// A voice the local model can speak with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
}

/// A voice offered by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVoice {
    pub voice_id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub preview_url: Option<String>,
}

/// Worker-side model state reported by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelState {
    Idle,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum WorkerRequest {
    Init,
    Status,
    Voices,
    Generate {
        request_id: RequestId,
        target_page: Option<PageId>,
        text: String,
        voice: String,
        speed: f32,
        allow_streaming: bool,
    },
    Shutdown,
}

impl WorkerRequest {
    pub fn action(&self) -> &'static str {
        match self {
            WorkerRequest::Init => "init",
            WorkerRequest::Status => "status",
            WorkerRequest::Voices => "voices",
            WorkerRequest::Generate { .. } => "generate",
            WorkerRequest::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum WorkerResponse {
    Status {
        state: ModelState,
        #[serde(default)]
        error: Option<String>,
    },
    Voices {
        voices: Vec<VoiceInfo>,
    },
    Accepted {
        request_id: RequestId,
    },
    Failed {
        message: String,
    },
    Ack,
}

/// Unsolicited worker to coordinator traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum WorkerEvent {
    StatusUpdate {
        status: LoadStatus,
        message: String,
        #[serde(default)]
        progress: Option<f32>,
    },
    AudioReady {
        request_id: RequestId,
        target_page: Option<PageId>,
        audio: EncodedAudio,
    },
    AudioChunk {
        request_id: RequestId,
        target_page: Option<PageId>,
        audio: EncodedAudio,
        chunk: ChunkInfo,
    },
    StreamEnd {
        request_id: RequestId,
        target_page: Option<PageId>,
    },
    AudioError {
        request_id: RequestId,
        target_page: Option<PageId>,
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// One request line written to a worker child's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEnvelope {
    pub id: u64,
    pub request: WorkerRequest,
}

/// One line read from a worker child's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerOutput {
    Response { id: u64, response: WorkerResponse },
    Event { event: WorkerEvent },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_messages_are_tagged_by_action() {
        let value = serde_json::to_value(PageMessage::StopAudio).expect("serializes");
        assert_eq!(value, json!({ "action": "stop-audio" }));

        let chunk = PageMessage::PlayAudioChunk {
            request_id: RequestId(7),
            audio: EncodedAudio::new(AudioFormat::Wav, vec![1, 2, 3]),
            chunk: ChunkInfo {
                index: 0,
                is_first: true,
                is_final: false,
            },
        };
        let value = serde_json::to_value(&chunk).expect("serializes");
        assert_eq!(value["action"], "play-audio-chunk");
        assert_eq!(value["request_id"], 7);
        assert_eq!(value["audio"]["format"], "audio/wav");
        assert_eq!(value["audio"]["bytes"], "AQID");
        assert_eq!(value["chunk"]["is_first"], true);
        assert_eq!(chunk.action(), "play-audio-chunk");
    }

    #[test]
    fn unknown_actions_decode_to_catch_all() {
        let page: PageMessage =
            serde_json::from_value(json!({ "action": "show-confetti" })).expect("decodes");
        assert_eq!(page, PageMessage::Unknown);

        let worker: WorkerEvent =
            serde_json::from_value(json!({ "action": "telemetry", "x": 1 })).expect("decodes");
        assert_eq!(worker, WorkerEvent::Unknown);
    }

    #[test]
    fn process_transport_lines_round_trip() {
        let line = serde_json::to_string(&WorkerEnvelope {
            id: 3,
            request: WorkerRequest::Status,
        })
        .expect("serializes");
        assert_eq!(line, r#"{"id":3,"request":{"action":"status"}}"#);

        let output: WorkerOutput = serde_json::from_str(
            r#"{"kind":"event","event":{"action":"stream-end","request_id":4,"target_page":2}}"#,
        )
        .expect("decodes");
        assert_eq!(
            output,
            WorkerOutput::Event {
                event: WorkerEvent::StreamEnd {
                    request_id: RequestId(4),
                    target_page: Some(PageId(2)),
                }
            }
        );
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let result = serde_json::from_value::<EncodedAudio>(
            json!({ "format": "audio/mpeg", "bytes": "not base64!" }),
        );
        assert!(result.is_err());
    }
}
