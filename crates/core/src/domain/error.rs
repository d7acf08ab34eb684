//! Engine-level errors

use crate::domain::backend::{BackendError, StreamId};
use crate::domain::channel::Mix;
use thiserror::Error;

/// Errors returned by engine operations
///
/// An operation that returns an error leaves the channel registry, the rule
/// store and the stream assignments as they were before the call.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Unknown stream: {0}")]
    UnknownStream(StreamId),

    #[error("No output device selected for the {0} mix")]
    NoDevice(Mix),

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// The requested output is one of the engine's own sinks
    #[error("Sink {0} is reserved and cannot be used as an output device")]
    ReservedDevice(String),

    #[error("Engine task failed: {0}")]
    Task(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
