//! Remote text-to-speech over an ElevenLabs-compatible REST API.

use crate::config::RemoteParams;
use crate::error::ReadError;
use crate::messages::{AudioFormat, EncodedAudio, RemoteVoice};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[async_trait]
pub trait RemoteSynth: Send + Sync {
    /// Synthesize `text` and return the complete compressed audio.
    async fn synthesize(&self, text: &str, params: &RemoteParams) -> Result<EncodedAudio, ReadError>;

    async fn voices(&self, api_key: &str) -> Result<Vec<RemoteVoice>, ReadError>;
}

const OUTPUT_FORMAT: &str = "mp3_44100_128";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 200;

#[derive(Debug, Serialize)]
struct SynthesisBody<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Debug, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
    style: f32,
    speed: f32,
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<RemoteVoice>,
}

#[derive(Debug, Clone)]
pub struct ElevenLabsClient {
    http: reqwest::Client,
    base_url: String,
}

impl ElevenLabsClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn stream_url(&self, voice_id: &str) -> String {
        format!(
            "{}/text-to-speech/{}/stream?output_format={OUTPUT_FORMAT}",
            self.base_url, voice_id
        )
    }

    fn voices_url(&self) -> String {
        format!("{}/voices", self.base_url)
    }
}

fn synthesis_body<'a>(text: &'a str, params: &'a RemoteParams) -> SynthesisBody<'a> {
    SynthesisBody {
        text,
        model_id: &params.model_id,
        voice_settings: VoiceSettings {
            stability: params.stability,
            similarity_boost: params.similarity_boost,
            style: params.style,
            speed: params.speed,
        },
    }
}

async fn status_error(response: reqwest::Response) -> ReadError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let excerpt: String = body.trim().chars().take(ERROR_BODY_LIMIT).collect();
    ReadError::Network(format!("API error: {status} - {excerpt}"))
}

#[async_trait]
impl RemoteSynth for ElevenLabsClient {
    async fn synthesize(&self, text: &str, params: &RemoteParams) -> Result<EncodedAudio, ReadError> {
        if text.trim().is_empty() {
            return Err(ReadError::NoText);
        }
        if params.api_key.is_empty() {
            return Err(ReadError::CredentialMissing);
        }

        let started = Instant::now();
        let mut response = self
            .http
            .post(self.stream_url(&params.voice_id))
            .header("xi-api-key", &params.api_key)
            .json(&synthesis_body(text, params))
            .send()
            .await?;
        if !response.status().is_success() {
            let err = status_error(response).await;
            warn!(voice = %params.voice_id, "Remote synthesis rejected: {err}");
            return Err(err);
        }

        // The stream endpoint sends the MP3 progressively; collect it whole.
        let mut bytes = Vec::new();
        let mut chunks = 0usize;
        while let Some(chunk) = response.chunk().await? {
            chunks += 1;
            bytes.extend_from_slice(&chunk);
        }
        if bytes.is_empty() {
            return Err(ReadError::Network("API returned no audio".to_string()));
        }

        info!(
            voice = %params.voice_id,
            chars = text.chars().count(),
            bytes = bytes.len(),
            chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Remote synthesis complete"
        );
        Ok(EncodedAudio::new(AudioFormat::Mpeg, bytes))
    }

    async fn voices(&self, api_key: &str) -> Result<Vec<RemoteVoice>, ReadError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ReadError::CredentialMissing);
        }
        let response = self
            .http
            .get(self.voices_url())
            .header("xi-api-key", api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let parsed: VoicesResponse = response.json().await?;
        debug!(count = parsed.voices.len(), "Fetched remote voices");
        Ok(parsed.voices)
    }
}
