//! Audio output on the default device.
//!
//! `rodio`'s output stream cannot leave the thread that opened it, so a
//! dedicated device thread owns the stream and the sink. Sources are queued
//! on one sink in start order; a start time past the end of the queue is
//! padded with silence so the sink plays the schedule as given.

use anyhow::{Context, Result, anyhow};
use read_aloud_core::messages::EncodedAudio;
use read_aloud_core::page::{AudioOutput, Decoded, PlaybackClock};
use rodio::buffer::SamplesBuffer;
use rodio::source::Zero;
use rodio::{Decoder, OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

enum DeviceCommand {
    Append {
        silence: Duration,
        buffer: SamplesBuffer<i16>,
    },
    Halt,
    Pause,
    Resume,
}

pub struct RodioOutput {
    commands: mpsc::Sender<DeviceCommand>,
    clock: PlaybackClock,
    /// Clock time at which everything queued so far has played.
    queued_end: Duration,
}

impl RodioOutput {
    /// Open the default output device on its own thread.
    pub fn open() -> Result<Self> {
        let (commands, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        thread::Builder::new()
            .name("audio-device".to_string())
            .spawn(move || device_thread(inbox, ready_tx))
            .context("Spawning audio device thread")?;
        ready_rx
            .recv()
            .map_err(|_| anyhow!("audio device thread exited during startup"))??;
        info!("Audio output ready");
        Ok(Self {
            commands,
            clock: PlaybackClock::new(),
            queued_end: Duration::ZERO,
        })
    }

    fn send(&self, command: DeviceCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("audio device thread stopped"))
    }
}

fn device_thread(inbox: mpsc::Receiver<DeviceCommand>, ready: mpsc::Sender<Result<()>>) {
    let opened = OutputStream::try_default()
        .context("Opening audio output")
        .and_then(|(stream, handle)| {
            let sink = Sink::try_new(&handle).context("Creating sink")?;
            Ok((stream, handle, sink))
        });
    let (_stream, handle, mut sink) = match opened {
        Ok(opened) => {
            let _ = ready.send(Ok(()));
            opened
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    while let Ok(command) = inbox.recv() {
        match command {
            DeviceCommand::Append { silence, buffer } => {
                if !silence.is_zero() {
                    let padding = Zero::<i16>::new(buffer.channels(), buffer.sample_rate())
                        .take_duration(silence);
                    sink.append(padding);
                }
                sink.append(buffer);
            }
            DeviceCommand::Halt => {
                // Stopped sinks ignore later appends.
                sink.stop();
                match Sink::try_new(&handle) {
                    Ok(fresh) => sink = fresh,
                    Err(err) => {
                        warn!("Failed to recreate sink: {err}");
                        break;
                    }
                }
            }
            DeviceCommand::Pause => sink.pause(),
            DeviceCommand::Resume => sink.play(),
        }
    }
    debug!("Audio device thread exiting");
}

impl AudioOutput for RodioOutput {
    type Buffer = SamplesBuffer<i16>;

    fn now(&self) -> Duration {
        self.clock.now()
    }

    fn decode(&mut self, audio: &EncodedAudio) -> Result<Decoded<SamplesBuffer<i16>>> {
        let decoder = Decoder::new(Cursor::new(audio.bytes.clone()))
            .with_context(|| format!("Decoding {} audio", audio.format.mime()))?;
        let channels = decoder.channels();
        let sample_rate = decoder.sample_rate();
        let samples: Vec<i16> = decoder.collect();
        if samples.is_empty() || channels == 0 || sample_rate == 0 {
            anyhow::bail!("decoded audio is empty");
        }
        let frames = samples.len() as f64 / channels as f64;
        let duration = Duration::from_secs_f64(frames / sample_rate as f64);
        trace!(
            channels,
            sample_rate,
            duration_ms = duration.as_millis() as u64,
            "Decoded audio"
        );
        Ok(Decoded {
            buffer: SamplesBuffer::new(channels, sample_rate, samples),
            duration,
        })
    }

    fn start(&mut self, buffer: SamplesBuffer<i16>, at: Duration) -> Result<()> {
        let now = self.clock.now();
        let queue_free_at = self.queued_end.max(now);
        let silence = at.saturating_sub(queue_free_at);
        let length = buffer.total_duration().unwrap_or_default();
        self.send(DeviceCommand::Append { silence, buffer })?;
        self.queued_end = queue_free_at + silence + length;
        Ok(())
    }

    fn halt(&mut self) {
        self.queued_end = self.clock.now();
        if let Err(err) = self.send(DeviceCommand::Halt) {
            warn!("Failed to halt audio: {err}");
        }
    }

    fn pause(&mut self) {
        self.clock.pause();
        if let Err(err) = self.send(DeviceCommand::Pause) {
            warn!("Failed to pause audio: {err}");
        }
    }

    fn resume(&mut self) {
        self.clock.resume();
        if let Err(err) = self.send(DeviceCommand::Resume) {
            warn!("Failed to resume audio: {err}");
        }
    }
}
