//! Audio server abstractions
//!
//! This module defines the boundary through which the engine touches the audio
//! server. Everything is expressed as typed records; implementations for a real
//! server live in the `infra` crate, and an in-memory one lives in
//! [`crate::testing`].

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by an [`AudioBackend`]
#[derive(Debug, Error)]
pub enum BackendError {
    /// The call did not finish within its time budget
    #[error("Command timed out: {0}")]
    Timeout(String),

    /// The server rejected the call
    #[error("Command failed: {command}: {reason}")]
    CommandFailed { command: String, reason: String },

    /// The control tool could not be started at all
    #[error("Failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),

    /// The server answered with something we could not understand
    #[error("Unparseable backend output: {0}")]
    Parse(String),

    /// The object the call referred to does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The event feed could not be established
    #[error("Subscription unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    pub fn failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Identifier of a server module (null sink, loopback, ...)
pub type ModuleId = u32;

/// Identifier of a playback stream (sink-input)
pub type StreamId = u32;

/// State of a named sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkInfo {
    pub index: u32,
    pub name: String,
    /// Module that owns the sink, when the server reports one
    pub owner_module: Option<ModuleId>,
    pub volume: u8,
    pub muted: bool,
}

/// A sink as presented to the user when choosing an output device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// A playback stream as reported by the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: StreamId,
    pub app_name: String,
    pub process_name: String,
    pub media_name: String,
    /// Index of the sink the stream currently plays into
    pub sink: Option<u32>,
    /// Module that created the stream (set for loopback inputs)
    pub owner_module: Option<ModuleId>,
}

/// Parameters for a loopback module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackParams {
    pub latency_ms: u32,
    /// Keep both endpoints where we put them
    pub pinned: bool,
    /// Disable channel remixing and adaptive rate/volume adjustment
    pub no_remix: bool,
}

impl Default for LoopbackParams {
    fn default() -> Self {
        Self {
            latency_ms: 150,
            pinned: true,
            no_remix: true,
        }
    }
}

/// Kind of change reported by the server's notification feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Remove,
    Change,
}

/// A single notification about a playback stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendEvent {
    pub kind: EventKind,
    pub stream: StreamId,
}

impl BackendEvent {
    pub fn new(kind: EventKind, stream: StreamId) -> Self {
        Self { kind, stream }
    }
}

/// Receiving end of a backend notification feed
pub type EventFeed = mpsc::UnboundedReceiver<BackendEvent>;

/// Trait for the primitive operations the engine needs from the audio server
///
/// Every call is synchronous and bounded in time; a timeout is reported as an
/// ordinary [`BackendError`].
pub trait AudioBackend: Send + Sync {
    /// Create a null sink and return the module that owns it
    fn create_sink(&self, name: &str, description: &str) -> Result<ModuleId>;

    /// Unload a module (sink or loopback)
    fn remove_module(&self, module: ModuleId) -> Result<()>;

    /// Look up a sink by name
    fn sink_info(&self, name: &str) -> Result<Option<SinkInfo>>;

    fn set_sink_volume(&self, name: &str, percent: u8) -> Result<()>;

    fn set_sink_mute(&self, name: &str, muted: bool) -> Result<()>;

    /// List every sink known to the server
    fn list_sinks(&self) -> Result<Vec<SinkDescriptor>>;

    /// Current default sink, if any
    fn default_sink(&self) -> Result<Option<String>>;

    fn set_default_sink(&self, name: &str) -> Result<()>;

    /// Create a loopback from `source` (a sink monitor) into `sink`
    fn create_loopback(&self, source: &str, sink: &str, params: LoopbackParams) -> Result<ModuleId>;

    /// Find the sink-input a loopback module feeds its destination through
    fn find_mixing_input(&self, module: ModuleId) -> Result<Option<StreamId>>;

    fn set_mixing_input_volume(&self, input: StreamId, percent: u8) -> Result<()>;

    fn set_mixing_input_mute(&self, input: StreamId, muted: bool) -> Result<()>;

    /// Move a playback stream onto a sink
    fn move_stream(&self, stream: StreamId, sink: &str) -> Result<()>;

    /// List every playback stream
    fn list_streams(&self) -> Result<Vec<StreamInfo>>;

    /// Fetch one playback stream; `None` once it has gone away
    fn stream_info(&self, stream: StreamId) -> Result<Option<StreamInfo>> {
        Ok(self.list_streams()?.into_iter().find(|s| s.id == stream))
    }

    /// Open the server's change-notification feed
    fn subscribe(&self) -> Result<EventFeed>;
}

/// Name of the monitor source of a sink
pub fn monitor_of(sink: &str) -> String {
    format!("{}.monitor", sink)
}
