//! Gapless scheduling of whole buffers and chunk streams on one output.

use super::output::AudioOutput;
use crate::error::ReadError;
use crate::messages::{ChunkInfo, EncodedAudio, PlaybackState};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledSource {
    index: u32,
    start: Duration,
    end: Duration,
}

/// Per-page playback session.
pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    state: PlaybackState,
    pending: VecDeque<ScheduledSource>,
    /// Where the next chunk starts; `None` outside a stream.
    cursor: Option<Duration>,
    stream_open: bool,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            state: PlaybackState::Idle,
            pending: VecDeque::new(),
            cursor: None,
            stream_open: false,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_open
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    /// Replace whatever is playing with one complete buffer.
    pub fn play_whole(&mut self, audio: &EncodedAudio) -> Result<(), ReadError> {
        self.stop();
        let decoded = match self.output.decode(audio) {
            Ok(decoded) => decoded,
            Err(err) => return Err(self.fail("decode", err)),
        };
        let now = self.output.now();
        if let Err(err) = self.output.start(decoded.buffer, now) {
            return Err(self.fail("start", err));
        }
        self.pending.push_back(ScheduledSource {
            index: 0,
            start: now,
            end: now + decoded.duration,
        });
        self.state = PlaybackState::Playing;
        debug!(
            duration_ms = decoded.duration.as_millis() as u64,
            "Playing whole buffer"
        );
        Ok(())
    }

    /// Schedule one chunk of a stream.
    ///
    /// Returns the output time the chunk starts at, or `None` when the chunk
    /// was ignored because no stream is open.
    pub fn play_chunk(
        &mut self,
        audio: &EncodedAudio,
        chunk: ChunkInfo,
    ) -> Result<Option<Duration>, ReadError> {
        if chunk.is_first {
            self.stop();
            self.cursor = Some(self.output.now());
            self.stream_open = true;
            self.state = PlaybackState::Playing;
        } else if !self.stream_open {
            trace!(index = chunk.index, "Ignoring chunk outside an open stream");
            return Ok(None);
        }

        let decoded = match self.output.decode(audio) {
            Ok(decoded) => decoded,
            Err(err) => return Err(self.fail("decode", err)),
        };
        let now = self.output.now();
        let start = self.cursor.map_or(now, |cursor| cursor.max(now));
        if let Err(err) = self.output.start(decoded.buffer, start) {
            return Err(self.fail("start", err));
        }
        let end = start + decoded.duration;
        self.cursor = Some(end);
        self.pending.push_back(ScheduledSource {
            index: chunk.index,
            start,
            end,
        });
        trace!(
            index = chunk.index,
            start_ms = start.as_millis() as u64,
            end_ms = end.as_millis() as u64,
            "Scheduled chunk"
        );

        if chunk.is_final {
            self.end_stream();
        }
        Ok(Some(start))
    }

    /// Mark the stream complete. Returns whether the session went idle.
    pub fn end_stream(&mut self) -> bool {
        if !self.stream_open {
            return false;
        }
        self.stream_open = false;
        if self.pending.is_empty() && self.state != PlaybackState::Paused {
            self.reset();
            return true;
        }
        false
    }

    /// Reap finished sources and settle the state.
    pub fn poll(&mut self) -> PlaybackState {
        if self.state != PlaybackState::Playing {
            return self.state;
        }
        let now = self.output.now();
        while let Some(source) = self.pending.front() {
            if source.end > now {
                break;
            }
            trace!(index = source.index, "Source finished");
            self.pending.pop_front();
        }
        if self.pending.is_empty() && !self.stream_open {
            debug!("Playback drained");
            self.reset();
        }
        self.state
    }

    /// Halt everything. Returns whether anything was playing.
    pub fn stop(&mut self) -> bool {
        let was_active = self.state != PlaybackState::Idle || !self.pending.is_empty();
        if was_active {
            self.output.halt();
            if self.state == PlaybackState::Paused {
                self.output.resume();
            }
        }
        self.reset();
        was_active
    }

    pub fn pause(&mut self) -> bool {
        if self.state != PlaybackState::Playing {
            return false;
        }
        self.output.pause();
        self.state = PlaybackState::Paused;
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != PlaybackState::Paused {
            return false;
        }
        self.output.resume();
        self.state = PlaybackState::Playing;
        true
    }

    /// Time left until the last scheduled source ends.
    pub fn remaining(&self) -> Duration {
        self.pending
            .back()
            .map(|last| last.end.saturating_sub(self.output.now()))
            .unwrap_or_default()
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.cursor = None;
        self.stream_open = false;
        self.state = PlaybackState::Idle;
    }

    fn fail(&mut self, stage: &'static str, err: anyhow::Error) -> ReadError {
        warn!(stage, "Playback failed: {err:#}");
        self.stop();
        ReadError::playback(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::output::testing::{ManualOutput, seconds};

    fn chunk(index: u32, is_first: bool, is_final: bool) -> ChunkInfo {
        ChunkInfo {
            index,
            is_first,
            is_final,
        }
    }

    fn secs(value: f64) -> Duration {
        Duration::from_secs_f64(value)
    }

    #[test]
    fn chunks_are_scheduled_back_to_back_despite_irregular_arrival() {
        let output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        assert_eq!(
            scheduler.play_chunk(&seconds(1.0), chunk(0, true, false)),
            Ok(Some(secs(0.0)))
        );
        output.advance(secs(0.2));
        assert_eq!(
            scheduler.play_chunk(&seconds(1.5), chunk(1, false, false)),
            Ok(Some(secs(1.0)))
        );
        output.advance(secs(0.9));
        assert_eq!(
            scheduler.play_chunk(&seconds(0.8), chunk(2, false, true)),
            Ok(Some(secs(2.5)))
        );
        assert_eq!(output.starts(), vec![secs(0.0), secs(1.0), secs(2.5)]);

        output.advance(secs(2.0));
        assert_eq!(scheduler.poll(), PlaybackState::Playing);
        assert_eq!(scheduler.pending(), 1);
        output.advance(secs(0.3));
        assert_eq!(scheduler.poll(), PlaybackState::Idle);
    }

    #[test]
    fn late_chunk_starts_now_instead_of_in_the_past() {
        let output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler
            .play_chunk(&seconds(0.5), chunk(0, true, false))
            .expect("first chunk");
        output.advance(secs(2.0));
        assert_eq!(
            scheduler.play_chunk(&seconds(0.5), chunk(1, false, false)),
            Ok(Some(secs(2.0)))
        );
        assert_eq!(scheduler.state(), PlaybackState::Playing);
    }

    #[test]
    fn stop_is_idempotent_on_an_idle_session() {
        let output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        assert!(!scheduler.stop());
        assert!(!scheduler.stop());
        assert_eq!(scheduler.state(), PlaybackState::Idle);
        assert_eq!(output.halts(), 0);

        scheduler.play_whole(&seconds(1.0)).expect("play");
        assert!(scheduler.stop());
        assert!(!scheduler.stop());
        assert_eq!(output.halts(), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn chunks_after_stop_are_ignored_until_a_new_stream() {
        let output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler
            .play_chunk(&seconds(1.0), chunk(0, true, false))
            .expect("first chunk");
        scheduler.stop();
        assert_eq!(
            scheduler.play_chunk(&seconds(1.0), chunk(1, false, false)),
            Ok(None)
        );
        assert_eq!(scheduler.state(), PlaybackState::Idle);
        assert_eq!(output.starts().len(), 1);
    }

    #[test]
    fn decode_failure_clears_the_stream() {
        let output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler
            .play_chunk(&seconds(1.0), chunk(0, true, false))
            .expect("first chunk");
        let garbage = EncodedAudio::new(crate::messages::AudioFormat::Wav, vec![0xff, 0xfe]);
        let err = scheduler
            .play_chunk(&garbage, chunk(1, false, false))
            .expect_err("decode fails");
        assert_eq!(err.kind(), "playback-failed");
        assert_eq!(scheduler.state(), PlaybackState::Idle);
        assert_eq!(
            scheduler.play_chunk(&seconds(1.0), chunk(2, false, false)),
            Ok(None)
        );
    }

    #[test]
    fn final_marker_with_nothing_pending_goes_idle_at_once() {
        let output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler
            .play_chunk(&seconds(0.5), chunk(0, true, false))
            .expect("first chunk");
        output.advance(secs(1.0));
        assert_eq!(scheduler.poll(), PlaybackState::Playing);
        assert!(scheduler.end_stream());
        assert_eq!(scheduler.state(), PlaybackState::Idle);
    }

    #[test]
    fn pause_freezes_the_schedule() {
        let output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler.play_whole(&seconds(1.0)).expect("play");
        output.advance(secs(0.5));
        assert!(scheduler.pause());
        output.advance(secs(5.0));
        assert_eq!(scheduler.poll(), PlaybackState::Paused);
        assert!(scheduler.resume());
        assert_eq!(scheduler.remaining(), secs(0.5));
        output.advance(secs(0.5));
        assert_eq!(scheduler.poll(), PlaybackState::Idle);
    }

    #[test]
    fn whole_buffer_replaces_an_open_stream() {
        let output = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new(output.clone());

        scheduler
            .play_chunk(&seconds(1.0), chunk(0, true, false))
            .expect("first chunk");
        scheduler.play_whole(&seconds(0.3)).expect("play");
        assert!(!scheduler.is_streaming());
        output.advance(secs(0.3));
        assert_eq!(scheduler.poll(), PlaybackState::Idle);
    }
}
