use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use read_aloud_core::bus::PageRegistry;
use read_aloud_core::config::{EnginePreference, RemoteParams, RuntimeConfig, Settings};
use read_aloud_core::coordinator::{Collaborators, Coordinator, SynthesisOutcome, SynthesisRequest};
use read_aloud_core::engine::EngineKind;
use read_aloud_core::error::ReadError;
use read_aloud_core::messages::{
    AudioFormat, EncodedAudio, LoadStatus, PageId, ReadOrigin, RemoteVoice, VoiceInfo,
};
use read_aloud_core::native::{NativeSpeech, NativeUtterance};
use read_aloud_core::page::{
    AudioOutput, Decoded, PageAgent, PageEvent, PageHandle, PageOptions, UiStatus,
};
use read_aloud_core::remote::RemoteSynth;
use read_aloud_core::store::MemoryStore;
use read_aloud_core::worker::{
    InProcessWorkerHost, ModelLoader, ProgressReporter, SpeechModel,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Remote voice whose audio lasts a fixed number of seconds.
struct FixedLengthRemote {
    seconds: f64,
}

#[async_trait]
impl RemoteSynth for FixedLengthRemote {
    async fn synthesize(
        &self,
        _text: &str,
        _params: &RemoteParams,
    ) -> Result<EncodedAudio, ReadError> {
        tokio::time::sleep(Duration::from_millis(120)).await;
        Ok(EncodedAudio::new(
            AudioFormat::Mpeg,
            self.seconds.to_string().into_bytes(),
        ))
    }

    async fn voices(&self, _api_key: &str) -> Result<Vec<RemoteVoice>, ReadError> {
        Ok(Vec::new())
    }
}

/// Output on tokio's clock; audio bytes are a decimal number of seconds.
#[derive(Clone)]
struct TokioClockOutput {
    origin: Instant,
    started: Arc<Mutex<Vec<(Duration, Duration)>>>,
}

impl TokioClockOutput {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            started: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl AudioOutput for TokioClockOutput {
    type Buffer = Duration;

    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn decode(&mut self, audio: &EncodedAudio) -> AnyResult<Decoded<Duration>> {
        let text = std::str::from_utf8(&audio.bytes).context("audio is not text")?;
        let duration = match text.trim().parse::<f64>() {
            Ok(secs) => Duration::from_secs_f64(secs),
            // Local model audio: a tenth of a second per byte.
            Err(_) => Duration::from_millis(100) * audio.bytes.len() as u32,
        };
        Ok(Decoded {
            buffer: duration,
            duration,
        })
    }

    fn start(&mut self, buffer: Duration, at: Duration) -> AnyResult<()> {
        self.started.lock().expect("lock").push((at, buffer));
        Ok(())
    }

    fn halt(&mut self) {}

    fn pause(&mut self) {}

    fn resume(&mut self) {}
}

struct SilentSpeech;

impl NativeSpeech for SilentSpeech {
    fn speak(&mut self, _utterance: &NativeUtterance) -> AnyResult<()> {
        Ok(())
    }

    fn cancel(&mut self) {}

    fn is_speaking(&mut self) -> bool {
        false
    }
}

/// Model that "speaks" each sentence as its own bytes.
struct SentenceModel;

impl SpeechModel for SentenceModel {
    fn voices(&self) -> Vec<VoiceInfo> {
        Vec::new()
    }

    fn generate(&self, text: &str, _voice: &str, _speed: f32) -> AnyResult<EncodedAudio> {
        Ok(EncodedAudio::new(AudioFormat::Wav, text.as_bytes().to_vec()))
    }

    fn stream(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
        emit: &mut dyn FnMut(EncodedAudio) -> AnyResult<()>,
    ) -> AnyResult<()> {
        for sentence in read_aloud_core::text::split_sentences(text) {
            emit(self.generate(&sentence, voice, speed)?)?;
        }
        Ok(())
    }
}

struct SentenceLoader;

#[async_trait]
impl ModelLoader for SentenceLoader {
    async fn load(&self, progress: ProgressReporter) -> AnyResult<Arc<dyn SpeechModel>> {
        progress.report(LoadStatus::Loading, "Loading model", None);
        Ok(Arc::new(SentenceModel))
    }
}

const PAGE: PageId = PageId(1);

struct Pipeline {
    coordinator: read_aloud_core::CoordinatorHandle,
    events: mpsc::UnboundedReceiver<PageEvent>,
    output: TokioClockOutput,
    _page: PageHandle,
}

fn pipeline(settings: Settings, remote_seconds: f64) -> Pipeline {
    let config = RuntimeConfig {
        worker_poll_interval_ms: 10,
        drain_poll_interval_ms: 20,
        streaming_threshold_chars: 20,
        ..RuntimeConfig::default()
    };
    let pages = PageRegistry::new();
    let inbox = pages.open(PAGE);
    let (coordinator, handle) = Coordinator::new(
        Collaborators {
            store: Arc::new(MemoryStore::with_settings(settings.clone())),
            remote: Arc::new(FixedLengthRemote {
                seconds: remote_seconds,
            }),
            worker_host: Arc::new(InProcessWorkerHost::new(
                Arc::new(SentenceLoader),
                config.streaming_threshold_chars,
            )),
            pages,
        },
        &config,
    );
    coordinator.spawn();

    let output = TokioClockOutput::new();
    let (agent, page, events) = PageAgent::new(
        PAGE,
        handle.clone(),
        inbox,
        output.clone(),
        SilentSpeech,
        PageOptions::new(&config, &settings),
    );
    agent.spawn();
    Pipeline {
        coordinator: handle,
        events,
        output,
        _page: page,
    }
}

async fn wait_for(events: &mut mpsc::UnboundedReceiver<PageEvent>, wanted: &UiStatus) {
    while let Some(event) = events.recv().await {
        if let PageEvent::StatusChanged(status) = event {
            if &status == wanted {
                return;
            }
        }
    }
    panic!("page closed before reaching {wanted:?}");
}

#[tokio::test(start_paused = true)]
async fn remote_round_trip_reaches_idle_after_the_audio_length() {
    let settings = Settings {
        engine: EnginePreference::Remote,
        api_key: "sk-test".to_string(),
        ..Settings::default()
    };
    let mut p = pipeline(settings, 1.5);

    let outcome = p
        .coordinator
        .synthesize(SynthesisRequest {
            text: "Hello world.".to_string(),
            page: Some(PAGE),
            origin: ReadOrigin::Shortcut,
        })
        .await
        .expect("synthesis");
    assert!(matches!(
        outcome,
        SynthesisOutcome::Delivered {
            engine: EngineKind::Remote,
            ..
        }
    ));

    wait_for(&mut p.events, &UiStatus::Playing).await;
    let started = Instant::now();
    wait_for(&mut p.events, &UiStatus::Idle).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(1600), "{elapsed:?}");

    let status = p.coordinator.status().await.expect("status");
    assert!(!status.is_playing);
}

#[tokio::test]
async fn local_stream_plays_back_to_back() {
    let settings = Settings {
        engine: EnginePreference::Local,
        ..Settings::default()
    };
    let mut p = pipeline(settings, 0.0);

    let outcome = p
        .coordinator
        .synthesize(SynthesisRequest {
            text: "First one. Second one. Third.".to_string(),
            page: Some(PAGE),
            origin: ReadOrigin::Page,
        })
        .await
        .expect("synthesis");
    assert!(matches!(outcome, SynthesisOutcome::Pending { .. }));

    tokio::time::timeout(Duration::from_secs(10), wait_for(&mut p.events, &UiStatus::Playing))
        .await
        .expect("playback started");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if p.output.started.lock().expect("lock").len() == 3 {
            break;
        }
        assert!(Instant::now() < deadline, "chunks never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = p.output.started.lock().expect("lock").clone();
    for pair in started.windows(2) {
        let (start, length) = pair[0];
        let (next_start, _) = pair[1];
        assert!(next_start >= start + length, "{started:?}");
    }
    // Chunks that arrive together are queued back to back with no gap.
    let (first_start, first_length) = started[0];
    assert!(started[1].0 <= first_start + first_length + Duration::from_millis(100));
}
