use crate::messages::EncodedAudio;
use anyhow::Result;
use std::time::{Duration, Instant};

/// Decoded audio ready to be started, with its exact play length.
pub struct Decoded<B> {
    pub buffer: B,
    pub duration: Duration,
}

/// An audio device with its own clock.
///
/// Times are offsets on the output clock, which stops advancing while the
/// output is paused. A source started in the future plays after silence; a
/// source started at the end of the previous one plays without a gap.
pub trait AudioOutput: Send {
    type Buffer: Send;

    fn now(&self) -> Duration;

    fn decode(&mut self, audio: &EncodedAudio) -> Result<Decoded<Self::Buffer>>;

    fn start(&mut self, buffer: Self::Buffer, at: Duration) -> Result<()>;

    /// Silence everything started so far.
    fn halt(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);
}

/// Wall-clock time that can be frozen.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    origin: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            paused_at: None,
            paused_total: Duration::ZERO,
        }
    }

    pub fn now(&self) -> Duration {
        let reference = self.paused_at.unwrap_or_else(Instant::now);
        reference
            .saturating_duration_since(self.origin)
            .saturating_sub(self.paused_total)
    }

    pub fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += paused_at.elapsed();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }
}
