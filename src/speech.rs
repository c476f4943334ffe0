//! Native speech through the platform's command-line synthesizer.
//!
//! `say` on macOS and `espeak-ng` elsewhere both read the text from stdin and
//! take a voice name and a words-per-minute rate.

use anyhow::{Context, Result};
use read_aloud_core::native::{NativeSpeech, NativeUtterance};
use std::io::Write;
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

const BASE_WPM: f32 = 175.0;

pub struct CommandSpeech {
    program: String,
    child: Option<Child>,
}

impl CommandSpeech {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            child: None,
        }
    }

    fn command(&self, utterance: &NativeUtterance) -> Command {
        let wpm = (BASE_WPM * utterance.rate).round().max(1.0) as u32;
        let mut cmd = Command::new(&self.program);
        if let Some(voice) = &utterance.voice {
            cmd.arg("-v").arg(voice);
        }
        if self.program.ends_with("say") {
            cmd.arg("-r").arg(wpm.to_string());
        } else {
            cmd.arg("-s").arg(wpm.to_string()).arg("--stdin");
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl NativeSpeech for CommandSpeech {
    fn speak(&mut self, utterance: &NativeUtterance) -> Result<()> {
        self.cancel();
        let mut child = self
            .command(utterance)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(utterance.text.as_bytes())
                .with_context(|| format!("Failed to write to {} stdin", self.program))?;
        }
        debug!(
            program = %self.program,
            pid = child.id(),
            chars = utterance.text.chars().count(),
            "Native speech started"
        );
        self.child = Some(child);
        Ok(())
    }

    fn cancel(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                debug!("Speech process already gone: {err}");
            }
            let _ = child.wait();
        }
    }

    fn is_speaking(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                if !status.success() {
                    warn!(program = %self.program, %status, "Native speech exited with an error");
                }
                self.child = None;
                false
            }
            Err(err) => {
                warn!(program = %self.program, "Failed to poll speech process: {err}");
                self.child = None;
                false
            }
        }
    }
}

impl Drop for CommandSpeech {
    fn drop(&mut self) {
        self.cancel();
    }
}
