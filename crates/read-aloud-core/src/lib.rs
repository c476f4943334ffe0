//! Core of the read-aloud pipeline.
//!
//! The coordinator picks an engine and dispatches synthesis, the worker
//! manager keeps one local model worker alive, and each page agent schedules
//! playback of whatever audio it is handed. Everything talks over typed
//! channels; the binary crate supplies the audio device, the native speech
//! program and the worker process.

pub mod bus;
pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod messages;
pub mod native;
pub mod page;
pub mod remote;
pub mod retry;
pub mod store;
pub mod text;
pub mod worker;

pub use coordinator::{Collaborators, Coordinator, CoordinatorHandle};
pub use error::ReadError;
