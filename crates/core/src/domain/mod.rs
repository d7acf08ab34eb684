//! Domain entities and business rules

pub mod backend;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod loopback;
pub mod monitor;
pub mod router;
pub mod rules;
pub mod volume;

// Re-export specific items to avoid ambiguous glob imports
pub use backend::{
    AudioBackend, BackendError, BackendEvent, EventFeed, EventKind, LoopbackParams, ModuleId,
    SinkDescriptor, SinkInfo, StreamId, StreamInfo,
};
pub use channel::{Channel, ChannelId, ChannelRegistry, Mix, DEFAULT_CHANNELS, SINK_PREFIX};
pub use config::{ChannelSettings, ConfigError, ConfigManager, DaemonConfig, DuetConfig, EngineState};
pub use engine::{Engine, EngineHandle, EngineOptions};
pub use error::EngineError;
pub use event::EngineEvent;
pub use loopback::{LoopbackMixEngine, MixEdge, SettleTiming};
pub use monitor::StreamMonitor;
pub use router::{RouteOutcome, Stream, StreamClass, StreamRouter, UNASSIGNED_SINK};
pub use rules::{RoutingRule, RoutingRuleStore};
pub use volume::{effective_volume, VolumeCompositor};
