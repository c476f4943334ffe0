//! The platform speech synthesizer, as seen by a page.

use anyhow::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct NativeUtterance {
    pub text: String,
    /// Voice name; `None` lets the platform choose.
    pub voice: Option<String>,
    /// Rate multiplier, 1.0 is normal speed.
    pub rate: f32,
}

/// Fire-and-forget speech. The page polls `is_speaking` to learn when the
/// utterance has finished.
pub trait NativeSpeech: Send {
    fn speak(&mut self, utterance: &NativeUtterance) -> Result<()>;

    /// Silence any current utterance. Safe to call when idle.
    fn cancel(&mut self);

    fn is_speaking(&mut self) -> bool;
}
