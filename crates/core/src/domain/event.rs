//! Change notifications published by the engine

use crate::domain::backend::StreamId;

/// Something observable changed inside the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ChannelsChanged,
    MixesChanged,
    MasterVolumeChanged(u8),
    RoutingRulesChanged,
    SetupChanged,
    StreamsChanged,
    StreamAdded { id: StreamId, app_name: String },
    StreamRemoved(StreamId),
    /// A saved state finished replaying
    StateApplied,
}

impl EngineEvent {
    /// Whether the change affects saved state
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            EngineEvent::ChannelsChanged
                | EngineEvent::MixesChanged
                | EngineEvent::MasterVolumeChanged(_)
                | EngineEvent::RoutingRulesChanged
                | EngineEvent::SetupChanged
        )
    }
}
