//! Volume composition for loopback edges
//!
//! The volume pushed to an edge is the channel's mix level scaled by the master
//! volume. Mute is never folded into the number; it lives on the edge's mute
//! flag.

use crate::domain::backend::AudioBackend;
use crate::domain::channel::{ChannelId, ChannelRegistry, Mix};
use crate::domain::error::Result;
use crate::domain::loopback::LoopbackMixEngine;
use tracing::{debug, warn};

pub const FULL_VOLUME: u8 = 100;

/// Clamp an arbitrary integer into the 0..=100 percent range
pub fn clamp_percent(value: i32) -> u8 {
    value.clamp(0, FULL_VOLUME as i32) as u8
}

/// `floor(level * master / 100)`
pub fn effective_volume(level: u8, master: u8) -> u8 {
    let level = level.min(FULL_VOLUME) as u32;
    let master = master.min(FULL_VOLUME) as u32;
    (level * master / FULL_VOLUME as u32) as u8
}

/// Holds the master volume and pushes composed volumes to live edges
#[derive(Debug, Clone)]
pub struct VolumeCompositor {
    master: u8,
}

impl VolumeCompositor {
    pub fn new() -> Self {
        Self { master: FULL_VOLUME }
    }

    pub fn master(&self) -> u8 {
        self.master
    }

    /// Store a new master volume, returning the clamped value
    pub fn set_master(&mut self, volume: i32) -> u8 {
        self.master = clamp_percent(volume);
        self.master
    }

    /// Effective edge volume for a channel level under the current master
    pub fn effective(&self, level: u8) -> u8 {
        effective_volume(level, self.master)
    }

    /// Push the composed volume to every live edge of both mixes
    ///
    /// Edges are updated in place. Returns the number of edges that could not
    /// be updated.
    pub fn reapply_all(
        &self,
        backend: &dyn AudioBackend,
        registry: &ChannelRegistry,
        loopbacks: &LoopbackMixEngine,
    ) -> usize {
        let mut failures = 0;
        for mix in Mix::ALL {
            for (channel_id, _) in loopbacks.edges(mix) {
                let Ok(channel) = registry.get(channel_id) else {
                    continue;
                };
                let volume = self.effective(channel.mix_level(mix));
                if let Err(e) = loopbacks.set_edge_volume(backend, mix, channel_id, volume) {
                    warn!(%mix, channel = %channel_id, error = %e, "Failed to apply master volume");
                    failures += 1;
                }
            }
        }
        debug!(master = self.master, failures, "Master volume applied to live edges");
        failures
    }

    /// Push the composed volume to one channel's edge in one mix
    ///
    /// Returns `false` when the channel has no live edge in that mix.
    pub fn reapply_channel(
        &self,
        backend: &dyn AudioBackend,
        registry: &ChannelRegistry,
        loopbacks: &LoopbackMixEngine,
        mix: Mix,
        channel_id: &ChannelId,
    ) -> Result<bool> {
        let level = registry.get(channel_id)?.mix_level(mix);
        loopbacks.set_edge_volume(backend, mix, channel_id, self.effective(level))
    }
}

impl Default for VolumeCompositor {
    fn default() -> Self {
        Self::new()
    }
}
