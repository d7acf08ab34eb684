//! Logical channels and their backing sinks
//!
//! A channel is a virtual sink that applications are routed into. Each channel
//! carries a basic sink level plus one level per mix (Personal, Stream). The set
//! of channels is fixed when the registry is created.

use crate::domain::backend::{AudioBackend, ModuleId};
use crate::domain::error::{EngineError, Result};
use crate::domain::volume::{clamp_percent, FULL_VOLUME};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Prefix shared by every sink the engine owns
pub const SINK_PREFIX: &str = "duet_";

/// Unique identifier for a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the two output blends a channel feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mix {
    /// What the user hears
    Personal,
    /// What goes out to the broadcast
    Stream,
}

impl Mix {
    pub const ALL: [Mix; 2] = [Mix::Personal, Mix::Stream];
}

impl fmt::Display for Mix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mix::Personal => write!(f, "personal"),
            Mix::Stream => write!(f, "stream"),
        }
    }
}

/// Static definition of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDef {
    pub id: &'static str,
    pub display_name: &'static str,
}

/// The fixed channel set
pub const DEFAULT_CHANNELS: [ChannelDef; 4] = [
    ChannelDef { id: "game", display_name: "Game" },
    ChannelDef { id: "chat", display_name: "Chat" },
    ChannelDef { id: "media", display_name: "Media" },
    ChannelDef { id: "aux", display_name: "AUX" },
];

/// Name of the sink backing a channel
pub fn sink_name_for(id: &str) -> String {
    format!("{}{}", SINK_PREFIX, id)
}

/// Snapshot of a channel's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub display_name: String,
    pub sink_name: String,
    pub volume: u8,
    pub muted: bool,
    pub personal_volume: u8,
    pub personal_muted: bool,
    pub stream_volume: u8,
    pub stream_muted: bool,
}

impl Channel {
    /// Personal listening starts fully on, broadcast mixing starts off.
    pub fn new(def: &ChannelDef) -> Self {
        Self {
            id: ChannelId::new(def.id),
            display_name: def.display_name.to_string(),
            sink_name: sink_name_for(def.id),
            volume: FULL_VOLUME,
            muted: false,
            personal_volume: FULL_VOLUME,
            personal_muted: false,
            stream_volume: 0,
            stream_muted: false,
        }
    }

    pub fn mix_level(&self, mix: Mix) -> u8 {
        match mix {
            Mix::Personal => self.personal_volume,
            Mix::Stream => self.stream_volume,
        }
    }

    pub fn mix_muted(&self, mix: Mix) -> bool {
        match mix {
            Mix::Personal => self.personal_muted,
            Mix::Stream => self.stream_muted,
        }
    }
}

#[derive(Debug, Clone)]
struct ChannelSlot {
    channel: Channel,
    sink_index: u32,
    module: Option<ModuleId>,
}

/// Owner of the fixed set of channels
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    defs: Vec<ChannelDef>,
    slots: Vec<ChannelSlot>,
}

impl ChannelRegistry {
    pub fn new(defs: &[ChannelDef]) -> Self {
        Self {
            defs: defs.to_vec(),
            slots: Vec::new(),
        }
    }

    /// Ensure every channel has a backing sink
    ///
    /// Existing sinks are reused. Each sink is normalised to 100% so a level
    /// remembered by the server from an earlier session cannot leak in. Calling
    /// this again keeps the stored levels of channels that already exist.
    pub fn create_channels(&mut self, backend: &dyn AudioBackend) -> Result<()> {
        for def in self.defs.clone() {
            let sink_name = sink_name_for(def.id);

            let module = match backend.sink_info(&sink_name)? {
                Some(existing) => {
                    info!(sink = %sink_name, "Virtual sink already exists");
                    existing.owner_module
                }
                None => {
                    let description = format!("Duet {}", def.display_name);
                    let module = backend.create_sink(&sink_name, &description)?;
                    info!(sink = %sink_name, module, "Created virtual sink");
                    Some(module)
                }
            };

            if let Err(e) = backend.set_sink_volume(&sink_name, FULL_VOLUME) {
                warn!(sink = %sink_name, error = %e, "Failed to normalise sink volume");
            }

            let sink = backend.sink_info(&sink_name)?.ok_or_else(|| {
                EngineError::Initialization(format!("sink {} vanished after creation", sink_name))
            })?;

            match self.slots.iter_mut().find(|s| s.channel.id.as_str() == def.id) {
                Some(slot) => {
                    slot.sink_index = sink.index;
                    slot.module = module;
                }
                None => self.slots.push(ChannelSlot {
                    channel: Channel::new(&def),
                    sink_index: sink.index,
                    module,
                }),
            }
        }

        Ok(())
    }

    /// Unload every channel sink and forget all channels
    pub fn teardown(&mut self, backend: &dyn AudioBackend) {
        for slot in self.slots.drain(..) {
            if let Some(module) = slot.module {
                match backend.remove_module(module) {
                    Ok(()) => debug!(channel = %slot.channel.id, module, "Removed channel sink"),
                    Err(e) => warn!(channel = %slot.channel.id, error = %e, "Failed to remove channel sink"),
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.slots.iter().any(|s| &s.channel.id == id)
    }

    /// Get a channel, failing if the id is not part of the set
    pub fn get(&self, id: &ChannelId) -> Result<&Channel> {
        self.slots
            .iter()
            .map(|s| &s.channel)
            .find(|c| &c.id == id)
            .ok_or_else(|| EngineError::UnknownChannel(id.to_string()))
    }

    /// All channels in definition order
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.slots.iter().map(|s| &s.channel)
    }

    pub fn list(&self) -> Vec<Channel> {
        self.channels().cloned().collect()
    }

    /// Channel whose sink has the given server index
    pub fn channel_for_sink(&self, sink_index: u32) -> Option<&ChannelId> {
        self.slots
            .iter()
            .find(|s| s.sink_index == sink_index)
            .map(|s| &s.channel.id)
    }

    fn slot_mut(&mut self, id: &ChannelId) -> Result<&mut ChannelSlot> {
        self.slots
            .iter_mut()
            .find(|s| &s.channel.id == id)
            .ok_or_else(|| EngineError::UnknownChannel(id.to_string()))
    }

    /// Set the basic sink level, returning the stored (clamped) value
    pub fn set_volume(&mut self, backend: &dyn AudioBackend, id: &ChannelId, volume: i32) -> Result<u8> {
        let slot = self.slot_mut(id)?;
        let volume = clamp_percent(volume);
        backend.set_sink_volume(&slot.channel.sink_name, volume)?;
        slot.channel.volume = volume;
        debug!(channel = %id, volume, "Channel volume set");
        Ok(volume)
    }

    pub fn set_mute(&mut self, backend: &dyn AudioBackend, id: &ChannelId, muted: bool) -> Result<()> {
        let slot = self.slot_mut(id)?;
        backend.set_sink_mute(&slot.channel.sink_name, muted)?;
        slot.channel.muted = muted;
        debug!(channel = %id, muted, "Channel mute set");
        Ok(())
    }

    /// Store a mix level; live edges are updated by the caller
    pub fn store_mix_level(&mut self, mix: Mix, id: &ChannelId, level: u8) -> Result<()> {
        let channel = &mut self.slot_mut(id)?.channel;
        match mix {
            Mix::Personal => channel.personal_volume = level,
            Mix::Stream => channel.stream_volume = level,
        }
        Ok(())
    }

    pub fn store_mix_muted(&mut self, mix: Mix, id: &ChannelId, muted: bool) -> Result<()> {
        let channel = &mut self.slot_mut(id)?.channel;
        match mix {
            Mix::Personal => channel.personal_muted = muted,
            Mix::Stream => channel.stream_muted = muted,
        }
        Ok(())
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(&DEFAULT_CHANNELS)
    }
}
