//! Piper voice model for the worker process.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hound::WavSpec;
use piper_rs::from_config_path;
use piper_rs::synth::{AudioOutputConfig, PiperSpeechSynthesizer};
use read_aloud_core::messages::{AudioFormat, EncodedAudio, LoadStatus, VoiceInfo};
use read_aloud_core::text::split_sentences;
use read_aloud_core::worker::{ModelLoader, ProgressReporter, SpeechModel};
use std::env;
use std::ffi::OsString;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ESPEAK_DATA_VAR: &str = "PIPER_ESPEAKNG_DATA_DIRECTORY";

type SharedModel = Arc<dyn piper_rs::PiperModel + Send + Sync>;

pub struct PiperLoader {
    model_path: PathBuf,
    espeak_path: PathBuf,
}

impl PiperLoader {
    pub fn new(model_path: PathBuf, espeak_path: PathBuf) -> Self {
        Self {
            model_path,
            espeak_path: sanitize_espeak_root(espeak_path),
        }
    }
}

/// Point Piper at the espeak-ng data unless the environment already does.
///
/// Must run before the process starts any other thread.
pub fn export_espeak_root(espeak_path: PathBuf) {
    if let Some(root) = espeak_root_to_export(env::var_os(ESPEAK_DATA_VAR), espeak_path) {
        // SAFETY: callers run this while the process is still single-threaded.
        unsafe {
            env::set_var(ESPEAK_DATA_VAR, root);
        }
    }
}

/// An explicit environment setting wins over the configured path.
fn espeak_root_to_export(current: Option<OsString>, configured: PathBuf) -> Option<PathBuf> {
    match current {
        Some(_) => None,
        None => Some(sanitize_espeak_root(configured)),
    }
}

#[async_trait]
impl ModelLoader for PiperLoader {
    async fn load(&self, progress: ProgressReporter) -> Result<Arc<dyn SpeechModel>> {
        let config_path = resolve_piper_config(&self.model_path);
        if !config_path.exists() {
            anyhow::bail!(
                "Piper config not found at {} (expected from {})",
                config_path.display(),
                self.model_path.display()
            );
        }
        progress.report(LoadStatus::Loading, "Loading Piper model...", None);
        info!(
            model = %self.model_path.display(),
            espeak_root = %self.espeak_path.display(),
            "Loading Piper model"
        );
        let model = tokio::task::spawn_blocking(move || from_config_path(&config_path))
            .await
            .context("Piper load task failed")?
            .context("Loading Piper model")?;
        let voice = self
            .model_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| "piper".to_string());
        Ok(Arc::new(PiperModel { model, voice }))
    }
}

struct PiperModel {
    model: SharedModel,
    voice: String,
}

impl PiperModel {
    fn synthesizer(&self) -> Result<PiperSpeechSynthesizer> {
        PiperSpeechSynthesizer::new(Arc::clone(&self.model)).context("Preparing Piper synthesizer")
    }

    fn synthesize_wav(
        &self,
        piper: &PiperSpeechSynthesizer,
        text: &str,
        speed: f32,
    ) -> Result<EncodedAudio> {
        let mut samples: Vec<f32> = Vec::new();
        let mut sample_rate: Option<u32> = None;
        let mut channels: Option<u16> = None;
        for chunk in piper.synthesize_lazy(text.to_string(), output_config(speed))? {
            let chunk = chunk?;
            if sample_rate.is_none() {
                sample_rate = Some(chunk.info.sample_rate as u32);
                channels = Some(chunk.info.num_channels as u16);
            }
            samples.extend_from_slice(chunk.samples.as_slice());
        }
        if samples.is_empty() {
            anyhow::bail!("No speech data produced");
        }
        let bytes = encode_wav(
            sample_rate.unwrap_or(22050),
            channels.unwrap_or(1),
            &samples,
        )?;
        debug!(chars = text.len(), bytes = bytes.len(), "Synthesized with Piper");
        Ok(EncodedAudio::new(AudioFormat::Wav, bytes))
    }
}

impl SpeechModel for PiperModel {
    fn voices(&self) -> Vec<VoiceInfo> {
        vec![VoiceInfo {
            id: self.voice.clone(),
            name: self.voice.clone(),
            language: self.voice.split('-').next().map(str::to_string),
            gender: None,
        }]
    }

    fn generate(&self, text: &str, voice: &str, speed: f32) -> Result<EncodedAudio> {
        if voice != self.voice {
            debug!(requested = voice, loaded = %self.voice, "Piper speaks with its loaded voice");
        }
        let piper = self.synthesizer()?;
        self.synthesize_wav(&piper, text, speed)
    }

    fn stream(
        &self,
        text: &str,
        _voice: &str,
        speed: f32,
        emit: &mut dyn FnMut(EncodedAudio) -> Result<()>,
    ) -> Result<()> {
        let piper = self.synthesizer()?;
        for sentence in split_sentences(text) {
            emit(self.synthesize_wav(&piper, &sentence, speed)?)?;
        }
        Ok(())
    }
}

fn output_config(speed: f32) -> Option<AudioOutputConfig> {
    if (speed - 1.0).abs() <= f32::EPSILON {
        return None;
    }
    Some(AudioOutputConfig {
        rate: Some(speed_to_rate_percent(speed)),
        volume: None,
        pitch: None,
        appended_silence_ms: None,
    })
}

fn encode_wav(sample_rate: u32, channels: u16, samples: &[f32]) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            let clamped = (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer.write_sample(clamped)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn resolve_piper_config(model_path: &Path) -> PathBuf {
    if model_path
        .extension()
        .map(|ext| ext == "onnx")
        .unwrap_or(false)
    {
        return model_path.with_extension("onnx.json");
    }
    model_path.to_path_buf()
}

/// Piper expects the parent directory that contains `espeak-ng-data/phonindex`.
fn sanitize_espeak_root(path: PathBuf) -> PathBuf {
    if path
        .file_name()
        .map(|n| n == "espeak-ng-data")
        .unwrap_or(false)
    {
        if let Some(parent) = path.parent() {
            return parent.to_path_buf();
        }
    }
    path
}

/// Piper's rate knob is a percentage of its 0.5x..5.5x range.
fn speed_to_rate_percent(speed: f32) -> u8 {
    let clamped = speed.clamp(0.5, 5.5);
    let percent = ((clamped - 0.5) / 5.0) * 100.0;
    percent.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_sits_next_to_the_onnx_file() {
        assert_eq!(
            resolve_piper_config(Path::new("/voices/en_US-ryan-high.onnx")),
            PathBuf::from("/voices/en_US-ryan-high.onnx.json")
        );
        assert_eq!(
            sanitize_espeak_root(PathBuf::from("/usr/share/espeak-ng-data")),
            PathBuf::from("/usr/share")
        );
    }

    #[test]
    fn configured_espeak_root_only_fills_a_missing_variable() {
        assert_eq!(
            espeak_root_to_export(None, PathBuf::from("/opt/espeak/espeak-ng-data")),
            Some(PathBuf::from("/opt/espeak"))
        );
        assert_eq!(
            espeak_root_to_export(Some(OsString::from("/custom")), PathBuf::from("/usr/share")),
            None
        );
    }

    #[test]
    fn wav_encoding_has_a_riff_header() {
        let bytes = encode_wav(22050, 1, &[0.0, 0.5, -0.5, 1.0]).expect("encode");
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(bytes.len(), 44 + 4 * 2);
    }
}
