//! Loopback edges feeding channels into the two mixes
//!
//! For each mix the engine keeps at most one edge per channel: a loopback
//! module reading the channel sink's monitor and playing it into the mix's
//! output device. Edges are only created and destroyed when the device or the
//! mix enablement changes; volume changes update a live edge in place.
//!
//! Creating or destroying an edge while audio flows is audible, so both
//! creation paths follow the same sequence: create the edge muted at 0%, let
//! the graph settle, set the real volume while still muted, then unmute.

use crate::domain::backend::{monitor_of, AudioBackend, LoopbackParams, ModuleId, StreamId};
use crate::domain::channel::{Channel, ChannelId, ChannelRegistry, Mix};
use crate::domain::error::{EngineError, Result};
use crate::domain::volume::VolumeCompositor;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A live edge: the loopback module and the sink-input it plays through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixEdge {
    pub module: ModuleId,
    pub input: StreamId,
}

/// Pauses that let the audio graph settle between protocol steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleTiming {
    /// After tearing down old edges
    pub teardown: Duration,
    /// Between creating a loopback and looking up its sink-input
    pub edge_appear: Duration,
    /// Between creating edges and giving them their real volume
    pub stabilize: Duration,
    /// Between setting volumes and unmuting edges
    pub unmute: Duration,
    /// Between unmuting edges and unmuting the device
    pub device_unmute: Duration,
    /// Between a stream appearing and trusting its metadata
    pub stream_settle: Duration,
}

impl SettleTiming {
    /// No pauses at all, for tests against an in-memory backend
    pub fn immediate() -> Self {
        Self {
            teardown: Duration::ZERO,
            edge_appear: Duration::ZERO,
            stabilize: Duration::ZERO,
            unmute: Duration::ZERO,
            device_unmute: Duration::ZERO,
            stream_settle: Duration::ZERO,
        }
    }
}

impl Default for SettleTiming {
    fn default() -> Self {
        Self {
            teardown: Duration::from_millis(50),
            edge_appear: Duration::from_millis(100),
            stabilize: Duration::from_millis(250),
            unmute: Duration::from_millis(100),
            device_unmute: Duration::from_millis(50),
            stream_settle: Duration::from_millis(100),
        }
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Default)]
struct MixSlot {
    device: Option<String>,
    enabled: bool,
    edges: BTreeMap<ChannelId, MixEdge>,
    /// Modules whose sink-input was never found; audio flows but is not controllable
    orphans: BTreeMap<ChannelId, ModuleId>,
}

/// Owner of the edges of both mixes
#[derive(Debug, Clone)]
pub struct LoopbackMixEngine {
    timing: SettleTiming,
    params: LoopbackParams,
    personal: MixSlot,
    stream: MixSlot,
}

impl LoopbackMixEngine {
    /// Personal mix starts enabled, Stream mix starts disabled
    pub fn new(timing: SettleTiming, params: LoopbackParams) -> Self {
        Self {
            timing,
            params,
            personal: MixSlot {
                enabled: true,
                ..MixSlot::default()
            },
            stream: MixSlot::default(),
        }
    }

    fn slot(&self, mix: Mix) -> &MixSlot {
        match mix {
            Mix::Personal => &self.personal,
            Mix::Stream => &self.stream,
        }
    }

    fn slot_mut(&mut self, mix: Mix) -> &mut MixSlot {
        match mix {
            Mix::Personal => &mut self.personal,
            Mix::Stream => &mut self.stream,
        }
    }

    pub fn timing(&self) -> SettleTiming {
        self.timing
    }

    pub fn device(&self, mix: Mix) -> Option<&str> {
        self.slot(mix).device.as_deref()
    }

    /// Store the destination device; returns whether it changed
    pub fn set_device(&mut self, mix: Mix, device: Option<String>) -> bool {
        let device = device.filter(|d| !d.is_empty());
        let slot = self.slot_mut(mix);
        if slot.device == device {
            return false;
        }
        info!(%mix, device = device.as_deref().unwrap_or("<none>"), "Output device set");
        slot.device = device;
        true
    }

    pub fn is_enabled(&self, mix: Mix) -> bool {
        self.slot(mix).enabled
    }

    /// Store the enablement flag; returns whether it changed
    pub fn set_enabled(&mut self, mix: Mix, enabled: bool) -> bool {
        let slot = self.slot_mut(mix);
        if slot.enabled == enabled {
            return false;
        }
        slot.enabled = enabled;
        info!(%mix, enabled, "Mix enablement changed");
        true
    }

    /// A mix is active when it is enabled and has a device to play into
    pub fn is_active(&self, mix: Mix) -> bool {
        let slot = self.slot(mix);
        slot.enabled && slot.device.is_some()
    }

    pub fn edges(&self, mix: Mix) -> impl Iterator<Item = (&ChannelId, &MixEdge)> {
        self.slot(mix).edges.iter()
    }

    pub fn edge(&self, mix: Mix, channel: &ChannelId) -> Option<MixEdge> {
        self.slot(mix).edges.get(channel).copied()
    }

    pub fn edge_count(&self, mix: Mix) -> usize {
        self.slot(mix).edges.len()
    }

    pub fn orphan_count(&self, mix: Mix) -> usize {
        self.slot(mix).orphans.len()
    }

    /// Every module the engine has allocated for edges, tracked or not
    pub fn tracked_modules(&self) -> HashSet<ModuleId> {
        Mix::ALL
            .iter()
            .flat_map(|&mix| {
                let slot = self.slot(mix);
                slot.edges
                    .values()
                    .map(|e| e.module)
                    .chain(slot.orphans.values().copied())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Update a live edge's volume in place; `false` if there is no edge
    pub fn set_edge_volume(
        &self,
        backend: &dyn AudioBackend,
        mix: Mix,
        channel: &ChannelId,
        percent: u8,
    ) -> Result<bool> {
        let Some(edge) = self.edge(mix, channel) else {
            return Ok(false);
        };
        backend.set_mixing_input_volume(edge.input, percent)?;
        debug!(%mix, %channel, percent, "Edge volume updated");
        Ok(true)
    }

    /// Update a live edge's mute flag; `false` if there is no edge
    pub fn set_edge_mute(
        &self,
        backend: &dyn AudioBackend,
        mix: Mix,
        channel: &ChannelId,
        muted: bool,
    ) -> Result<bool> {
        let Some(edge) = self.edge(mix, channel) else {
            return Ok(false);
        };
        backend.set_mixing_input_mute(edge.input, muted)?;
        debug!(%mix, %channel, muted, "Edge mute updated");
        Ok(true)
    }

    /// Create a loopback for one channel and silence it immediately
    ///
    /// When the module's sink-input cannot be found, the module is kept (audio
    /// still flows) and remembered as an orphan of its slot.
    fn spawn_muted_edge(
        &mut self,
        backend: &dyn AudioBackend,
        mix: Mix,
        device: &str,
        channel: &Channel,
    ) -> Result<Option<MixEdge>> {
        let module = backend.create_loopback(&monitor_of(&channel.sink_name), device, self.params)?;
        debug!(%mix, channel = %channel.id, module, "Created loopback");

        pause(self.timing.edge_appear);

        let input = match backend.find_mixing_input(module) {
            Ok(Some(input)) => input,
            Ok(None) => {
                warn!(%mix, channel = %channel.id, module, "Loopback sink-input not found, edge left untracked");
                self.slot_mut(mix).orphans.insert(channel.id.clone(), module);
                return Ok(None);
            }
            Err(e) => {
                warn!(%mix, channel = %channel.id, module, error = %e, "Loopback sink-input lookup failed, edge left untracked");
                self.slot_mut(mix).orphans.insert(channel.id.clone(), module);
                return Ok(None);
            }
        };

        if let Err(e) = backend.set_mixing_input_volume(input, 0) {
            warn!(%mix, channel = %channel.id, error = %e, "Failed to zero new edge");
        }
        if let Err(e) = backend.set_mixing_input_mute(input, true) {
            warn!(%mix, channel = %channel.id, error = %e, "Failed to mute new edge");
        }

        let edge = MixEdge { module, input };
        self.slot_mut(mix).edges.insert(channel.id.clone(), edge);
        Ok(Some(edge))
    }

    /// Tear down and recreate every edge of a mix
    ///
    /// The device is muted for the whole sequence. Returns the number of edges
    /// that ended up tracked.
    pub fn rebuild_all(
        &mut self,
        backend: &dyn AudioBackend,
        registry: &ChannelRegistry,
        compositor: &VolumeCompositor,
        mix: Mix,
    ) -> Result<usize> {
        let device = self
            .slot(mix)
            .device
            .clone()
            .ok_or(EngineError::NoDevice(mix))?;
        info!(%mix, %device, "Rebuilding mix edges");

        backend.set_sink_mute(&device, true)?;

        self.remove_all(backend, mix);
        pause(self.timing.teardown);

        for channel in registry.channels() {
            if let Err(e) = self.spawn_muted_edge(backend, mix, &device, channel) {
                warn!(%mix, channel = %channel.id, error = %e, "Failed to create loopback");
            }
        }

        pause(self.timing.stabilize);

        let edges: Vec<(ChannelId, MixEdge)> = self
            .edges(mix)
            .map(|(id, edge)| (id.clone(), *edge))
            .collect();

        for (id, edge) in &edges {
            let Ok(channel) = registry.get(id) else {
                continue;
            };
            let volume = compositor.effective(channel.mix_level(mix));
            if let Err(e) = backend.set_mixing_input_volume(edge.input, volume) {
                warn!(%mix, channel = %id, error = %e, "Failed to set edge volume");
            }
        }

        pause(self.timing.unmute);

        for (id, edge) in &edges {
            let muted = registry.get(id).map(|c| c.mix_muted(mix)).unwrap_or(false);
            if muted {
                continue;
            }
            if let Err(e) = backend.set_mixing_input_mute(edge.input, false) {
                warn!(%mix, channel = %id, error = %e, "Failed to unmute edge");
            }
        }

        pause(self.timing.device_unmute);
        backend.set_sink_mute(&device, false)?;

        info!(%mix, edges = edges.len(), "Mix edges rebuilt");
        Ok(edges.len())
    }

    /// Create the edge for one channel if it does not exist yet
    ///
    /// Other channels' edges are left alone. Returns the edge when one was
    /// created and is controllable.
    pub fn ensure_edge(
        &mut self,
        backend: &dyn AudioBackend,
        registry: &ChannelRegistry,
        compositor: &VolumeCompositor,
        mix: Mix,
        channel_id: &ChannelId,
    ) -> Result<Option<MixEdge>> {
        let channel = registry.get(channel_id)?;
        if self.slot(mix).edges.contains_key(channel_id) || !self.is_active(mix) {
            return Ok(None);
        }
        let Some(device) = self.slot(mix).device.clone() else {
            return Ok(None);
        };

        if let Some(orphan) = self.slot_mut(mix).orphans.remove(channel_id) {
            if let Err(e) = backend.remove_module(orphan) {
                warn!(%mix, channel = %channel_id, module = orphan, error = %e, "Failed to release untracked loopback");
            }
        }

        let Some(edge) = self.spawn_muted_edge(backend, mix, &device, channel)? else {
            return Ok(None);
        };

        pause(self.timing.stabilize);

        let volume = compositor.effective(channel.mix_level(mix));
        if let Err(e) = backend.set_mixing_input_volume(edge.input, volume) {
            warn!(%mix, channel = %channel_id, error = %e, "Failed to set edge volume");
        }

        pause(self.timing.unmute);

        if !channel.mix_muted(mix) {
            backend.set_mixing_input_mute(edge.input, false)?;
        }

        info!(%mix, channel = %channel_id, module = edge.module, "Edge created");
        Ok(Some(edge))
    }

    /// Tear down one channel's edge; `false` if it had none
    pub fn remove_edge(&mut self, backend: &dyn AudioBackend, mix: Mix, channel: &ChannelId) -> Result<bool> {
        if let Some(orphan) = self.slot(mix).orphans.get(channel).copied() {
            backend.remove_module(orphan)?;
            self.slot_mut(mix).orphans.remove(channel);
        }

        let Some(edge) = self.edge(mix, channel) else {
            return Ok(false);
        };
        backend.remove_module(edge.module)?;
        self.slot_mut(mix).edges.remove(channel);
        info!(%mix, %channel, "Edge removed");
        Ok(true)
    }

    /// Tear down every edge of a mix, tracked or not
    pub fn remove_all(&mut self, backend: &dyn AudioBackend, mix: Mix) {
        let slot = self.slot_mut(mix);
        let modules: Vec<(ChannelId, ModuleId)> = slot
            .edges
            .iter()
            .map(|(id, edge)| (id.clone(), edge.module))
            .chain(slot.orphans.iter().map(|(id, module)| (id.clone(), *module)))
            .collect();
        slot.edges.clear();
        slot.orphans.clear();

        for (channel, module) in modules {
            if let Err(e) = backend.remove_module(module) {
                warn!(%mix, %channel, module, error = %e, "Failed to remove loopback");
            }
        }
    }
}

impl Default for LoopbackMixEngine {
    fn default() -> Self {
        Self::new(SettleTiming::default(), LoopbackParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeBackend};

    fn setup() -> (FakeBackend, ChannelRegistry, VolumeCompositor, LoopbackMixEngine) {
        let backend = FakeBackend::new();
        backend.add_output_device("alsa_output.headphones");
        let mut registry = ChannelRegistry::default();
        registry.create_channels(&backend).unwrap();
        let loopbacks = LoopbackMixEngine::new(SettleTiming::immediate(), LoopbackParams::default());
        (backend, registry, VolumeCompositor::new(), loopbacks)
    }

    #[test]
    fn test_rebuild_requires_device() {
        let (backend, registry, compositor, mut loopbacks) = setup();
        let err = loopbacks
            .rebuild_all(&backend, &registry, &compositor, Mix::Personal)
            .unwrap_err();
        assert!(matches!(err, EngineError::NoDevice(Mix::Personal)));
    }

    #[test]
    fn test_rebuild_creates_one_audible_edge_per_channel() {
        let (backend, registry, compositor, mut loopbacks) = setup();
        loopbacks.set_device(Mix::Personal, Some("alsa_output.headphones".into()));

        let created = loopbacks
            .rebuild_all(&backend, &registry, &compositor, Mix::Personal)
            .unwrap();

        assert_eq!(created, 4);
        for (_, edge) in loopbacks.edges(Mix::Personal) {
            let input = backend.input(edge.input).unwrap();
            assert_eq!(input.volume, 100);
            assert!(!input.muted);
        }
        assert!(!backend.sink_info("alsa_output.headphones").unwrap().unwrap().muted);
    }

    #[test]
    fn test_rebuild_follows_the_muted_sequence() {
        let (backend, registry, compositor, mut loopbacks) = setup();
        loopbacks.set_device(Mix::Personal, Some("alsa_output.headphones".into()));
        backend.clear_calls();

        loopbacks
            .rebuild_all(&backend, &registry, &compositor, Mix::Personal)
            .unwrap();

        let calls = backend.calls();
        let device_mute = calls
            .iter()
            .position(|c| *c == Call::SetSinkMute("alsa_output.headphones".into(), true))
            .unwrap();
        let first_loopback = calls
            .iter()
            .position(|c| matches!(c, Call::CreateLoopback(..)))
            .unwrap();
        let last_loopback = calls
            .iter()
            .rposition(|c| matches!(c, Call::CreateLoopback(..)))
            .unwrap();
        let first_real_volume = calls
            .iter()
            .position(|c| matches!(c, Call::SetInputVolume(_, v) if *v > 0))
            .unwrap();
        let first_unmute = calls
            .iter()
            .position(|c| matches!(c, Call::SetInputMute(_, false)))
            .unwrap();
        let last_real_volume = calls
            .iter()
            .rposition(|c| matches!(c, Call::SetInputVolume(_, v) if *v > 0))
            .unwrap();
        let device_unmute = calls
            .iter()
            .position(|c| *c == Call::SetSinkMute("alsa_output.headphones".into(), false))
            .unwrap();

        assert!(device_mute < first_loopback);
        assert!(last_loopback < first_real_volume);
        assert!(last_real_volume < first_unmute);
        assert!(first_unmute < device_unmute);
        assert_eq!(device_unmute, calls.len() - 1);
    }

    #[test]
    fn test_rebuild_replaces_previous_edges() {
        let (backend, registry, compositor, mut loopbacks) = setup();
        loopbacks.set_device(Mix::Personal, Some("alsa_output.headphones".into()));
        loopbacks
            .rebuild_all(&backend, &registry, &compositor, Mix::Personal)
            .unwrap();
        let old: HashSet<_> = loopbacks.tracked_modules();

        loopbacks
            .rebuild_all(&backend, &registry, &compositor, Mix::Personal)
            .unwrap();

        assert_eq!(loopbacks.edge_count(Mix::Personal), 4);
        assert_eq!(backend.loopback_count(), 4);
        assert!(loopbacks.tracked_modules().is_disjoint(&old));
    }

    #[test]
    fn test_rebuild_keeps_mix_muted_channels_muted() {
        let (backend, mut registry, compositor, mut loopbacks) = setup();
        let chat = ChannelId::new("chat");
        registry.store_mix_muted(Mix::Personal, &chat, true).unwrap();
        loopbacks.set_device(Mix::Personal, Some("alsa_output.headphones".into()));

        loopbacks
            .rebuild_all(&backend, &registry, &compositor, Mix::Personal)
            .unwrap();

        let chat_edge = loopbacks.edge(Mix::Personal, &chat).unwrap();
        assert!(backend.input(chat_edge.input).unwrap().muted);
        let game_edge = loopbacks.edge(Mix::Personal, &ChannelId::new("game")).unwrap();
        assert!(!backend.input(game_edge.input).unwrap().muted);
    }

    #[test]
    fn test_untracked_module_is_kept_then_released() {
        let (backend, registry, compositor, mut loopbacks) = setup();
        loopbacks.set_device(Mix::Personal, Some("alsa_output.headphones".into()));
        backend.hide_mixing_inputs(true);

        loopbacks
            .rebuild_all(&backend, &registry, &compositor, Mix::Personal)
            .unwrap();

        assert_eq!(loopbacks.edge_count(Mix::Personal), 0);
        assert_eq!(loopbacks.orphan_count(Mix::Personal), 4);
        assert_eq!(backend.loopback_count(), 4);
        assert_eq!(loopbacks.tracked_modules().len(), 4);

        backend.hide_mixing_inputs(false);
        let game = ChannelId::new("game");
        let edge = loopbacks
            .ensure_edge(&backend, &registry, &compositor, Mix::Personal, &game)
            .unwrap();

        assert!(edge.is_some());
        assert_eq!(loopbacks.orphan_count(Mix::Personal), 3);
        assert_eq!(backend.loopback_count(), 4);

        loopbacks.remove_all(&backend, Mix::Personal);
        assert_eq!(backend.loopback_count(), 0);
    }

    #[test]
    fn test_ensure_edge_leaves_other_edges_alone() {
        let (backend, registry, compositor, mut loopbacks) = setup();
        loopbacks.set_device(Mix::Personal, Some("alsa_output.headphones".into()));
        let game = ChannelId::new("game");
        let chat = ChannelId::new("chat");

        let first = loopbacks
            .ensure_edge(&backend, &registry, &compositor, Mix::Personal, &game)
            .unwrap()
            .unwrap();
        loopbacks
            .ensure_edge(&backend, &registry, &compositor, Mix::Personal, &chat)
            .unwrap();
        let again = loopbacks
            .ensure_edge(&backend, &registry, &compositor, Mix::Personal, &game)
            .unwrap();

        assert!(again.is_none());
        assert_eq!(loopbacks.edge(Mix::Personal, &game), Some(first));
        assert_eq!(loopbacks.edge_count(Mix::Personal), 2);
        let input = backend.input(first.input).unwrap();
        assert_eq!(input.volume, 100);
        assert!(!input.muted);
    }

    #[test]
    fn test_ensure_edge_is_noop_on_inactive_mix() {
        let (backend, registry, compositor, mut loopbacks) = setup();
        loopbacks.set_device(Mix::Stream, Some("alsa_output.headphones".into()));

        let edge = loopbacks
            .ensure_edge(&backend, &registry, &compositor, Mix::Stream, &ChannelId::new("game"))
            .unwrap();

        assert!(edge.is_none());
        assert_eq!(backend.loopback_count(), 0);
    }

    #[test]
    fn test_remove_edge() {
        let (backend, registry, compositor, mut loopbacks) = setup();
        loopbacks.set_device(Mix::Personal, Some("alsa_output.headphones".into()));
        loopbacks
            .rebuild_all(&backend, &registry, &compositor, Mix::Personal)
            .unwrap();
        let media = ChannelId::new("media");

        assert!(loopbacks.remove_edge(&backend, Mix::Personal, &media).unwrap());
        assert!(!loopbacks.remove_edge(&backend, Mix::Personal, &media).unwrap());
        assert_eq!(loopbacks.edge_count(Mix::Personal), 3);
        assert_eq!(backend.loopback_count(), 3);
    }

    #[test]
    fn test_set_edge_volume_without_edge() {
        let (backend, _registry, _compositor, loopbacks) = setup();
        let updated = loopbacks
            .set_edge_volume(&backend, Mix::Personal, &ChannelId::new("game"), 40)
            .unwrap();
        assert!(!updated);
    }

    #[test]
    fn test_set_device_ignores_empty_and_unchanged() {
        let mut loopbacks = LoopbackMixEngine::default();
        assert!(!loopbacks.set_device(Mix::Personal, Some(String::new())));
        assert!(loopbacks.set_device(Mix::Personal, Some("hw".into())));
        assert!(!loopbacks.set_device(Mix::Personal, Some("hw".into())));
        assert!(loopbacks.is_active(Mix::Personal));
        assert!(!loopbacks.is_active(Mix::Stream));
    }
}
