use anyhow::{Result, anyhow};
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

const ACTIVE: u8 = 0;
const SUPERSEDED: u8 = 1;
const STOPPED: u8 = 2;

/// Why a request stopped being current for its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer request for the same page replaced it.
    Superseded,
    /// An explicit stop invalidated everything in flight.
    Stopped,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Superseded => "superseded",
            CancelReason::Stopped => "stopped",
        }
    }
}

/// Shared flag marking a synthesis request as no longer deliverable.
///
/// In-flight network calls are never aborted; their results are dropped
/// when the token has been cancelled by the time they complete.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    state: Arc<AtomicU8>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// First cancellation wins; later calls keep the original reason.
    pub fn cancel(&self, reason: CancelReason) {
        let next = match reason {
            CancelReason::Superseded => SUPERSEDED,
            CancelReason::Stopped => STOPPED,
        };
        let _ = self
            .state
            .compare_exchange(ACTIVE, next, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) != ACTIVE
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.state.load(Ordering::Acquire) {
            SUPERSEDED => Some(CancelReason::Superseded),
            STOPPED => Some(CancelReason::Stopped),
            _ => None,
        }
    }

    pub fn check_cancelled(&self, stage: &'static str) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(anyhow!(
                "request {} at stage={stage}",
                reason.as_str()
            )),
            None => Ok(()),
        }
    }
}
