//! Engine selection and fallback policy.
//!
//! `select_engine` is a pure function of the settings. The fallback chain is
//! plain data the coordinator walks, so the policy can be tested without any
//! engine behind it.

use crate::config::{EnginePreference, FallbackEngine, Settings};
use crate::error::ReadError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Remote,
    Local,
    Native,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Remote => "remote",
            EngineKind::Local => "local",
            EngineKind::Native => "native",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EngineKind::Remote => "Remote voice",
            EngineKind::Local => "Local model",
            EngineKind::Native => "Native speech",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FallbackEngine> for EngineKind {
    fn from(value: FallbackEngine) -> Self {
        match value {
            FallbackEngine::Native => EngineKind::Native,
            FallbackEngine::Local => EngineKind::Local,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub engine: EngineKind,
    /// Informational message for the page when the preference was demoted.
    pub notice: Option<String>,
}

pub fn select_engine(settings: &Settings) -> Selection {
    let engine = match settings.engine {
        EnginePreference::Remote if settings.has_credential() => EngineKind::Remote,
        EnginePreference::Remote => {
            let demoted = EngineKind::from(settings.fallback_engine);
            return Selection {
                engine: demoted,
                notice: Some(format!(
                    "No API key configured; using {} instead of the remote voice.",
                    demoted.label().to_lowercase()
                )),
            };
        }
        EnginePreference::Local => EngineKind::Local,
        EnginePreference::Native => EngineKind::Native,
        EnginePreference::Auto if settings.has_credential() => EngineKind::Remote,
        EnginePreference::Auto => EngineKind::Native,
    };
    Selection {
        engine,
        notice: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackStep {
    pub engine: EngineKind,
    pub on_failure: Option<EngineKind>,
}

/// Ordered (engine, on-failure-goto) pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChain {
    steps: Vec<FallbackStep>,
}

impl FallbackChain {
    /// Remote falls back once to native speech. The local model is never a
    /// fallback target because it is slow and was not requested.
    pub fn for_engine(engine: EngineKind) -> Self {
        let steps = match engine {
            EngineKind::Remote => vec![
                FallbackStep {
                    engine: EngineKind::Remote,
                    on_failure: Some(EngineKind::Native),
                },
                FallbackStep {
                    engine: EngineKind::Native,
                    on_failure: None,
                },
            ],
            other => vec![FallbackStep {
                engine: other,
                on_failure: None,
            }],
        };
        Self { steps }
    }

    pub fn first(&self) -> FallbackStep {
        self.steps[0]
    }

    pub fn steps(&self) -> &[FallbackStep] {
        &self.steps
    }

    /// Next step after `current` failed with `err`, if policy allows one.
    pub fn next_after(&self, current: FallbackStep, err: &ReadError) -> Option<FallbackStep> {
        if !err.is_transport() {
            return None;
        }
        let target = current.on_failure?;
        self.steps
            .iter()
            .copied()
            .find(|step| step.engine == target && step.engine != current.engine)
    }
}
