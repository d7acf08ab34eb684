//! The engine context
//!
//! [`Engine`] owns the channel registry, the rule store, the stream router, the
//! loopback engine and the volume compositor, and is the only thing that talks
//! to the backend. Every public operation runs to completion before the next
//! one starts; [`EngineHandle`] is how async code gets at it.

use crate::domain::backend::{AudioBackend, LoopbackParams, ModuleId, SinkDescriptor, StreamId, StreamInfo};
use crate::domain::channel::{Channel, ChannelId, ChannelRegistry, Mix, SINK_PREFIX};
use crate::domain::config::{ChannelSettings, DaemonConfig, EngineState};
use crate::domain::error::{EngineError, Result};
use crate::domain::event::EngineEvent;
use crate::domain::loopback::{LoopbackMixEngine, MixEdge, SettleTiming};
use crate::domain::router::{classify, RouteOutcome, Stream, StreamClass, StreamRouter, UNASSIGNED_SINK};
use crate::domain::rules::{RoutingRule, RoutingRuleStore};
use crate::domain::volume::{clamp_percent, VolumeCompositor};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Construction parameters of an [`Engine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub unassigned_sink: String,
    pub timing: SettleTiming,
    pub loopback: LoopbackParams,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            unassigned_sink: UNASSIGNED_SINK.to_string(),
            timing: SettleTiming::default(),
            loopback: LoopbackParams::default(),
        }
    }
}

impl From<&DaemonConfig> for EngineOptions {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            unassigned_sink: config.unassigned_sink.clone(),
            timing: config.settle_timing(),
            loopback: config.loopback_params(),
        }
    }
}

/// The routing and mix engine
pub struct Engine {
    backend: Arc<dyn AudioBackend>,
    registry: ChannelRegistry,
    rules: RoutingRuleStore,
    router: StreamRouter,
    loopbacks: LoopbackMixEngine,
    compositor: VolumeCompositor,
    initialized: bool,
    loading: bool,
    setup_complete: bool,
    unassigned_module: Option<ModuleId>,
    events: broadcast::Sender<EngineEvent>,
}

impl Engine {
    pub fn new(backend: Arc<dyn AudioBackend>, options: EngineOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            registry: ChannelRegistry::default(),
            rules: RoutingRuleStore::new(),
            router: StreamRouter::new(options.unassigned_sink),
            loopbacks: LoopbackMixEngine::new(options.timing, options.loopback),
            compositor: VolumeCompositor::new(),
            initialized: false,
            loading: false,
            setup_complete: false,
            unassigned_module: None,
            events,
        }
    }

    pub fn backend(&self) -> Arc<dyn AudioBackend> {
        Arc::clone(&self.backend)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn timing(&self) -> SettleTiming {
        self.loopbacks.timing()
    }

    /// Read-only view of the mix edges
    pub fn loopbacks(&self) -> &LoopbackMixEngine {
        &self.loopbacks
    }

    fn emit(&self, event: EngineEvent) {
        if self.loading && event.is_persistent() {
            return;
        }
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn is_reserved_sink(&self, name: &str) -> bool {
        name.starts_with(SINK_PREFIX) || name == self.router.unassigned_sink()
    }

    // ---- lifecycle ----

    /// Create the unassigned sink and every channel sink, then reconcile with
    /// the streams already playing and build the active mixes
    ///
    /// Failing to create any reserved sink is fatal.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        info!("Initializing audio engine");

        let previous_default = match self.backend.default_sink() {
            Ok(default) => default,
            Err(e) => {
                warn!(error = %e, "Could not read the default sink");
                None
            }
        };

        self.ensure_unassigned_sink().map_err(|e| {
            error!(error = %e, "Failed to create the unassigned sink");
            EngineError::Initialization(format!("unassigned sink: {}", e))
        })?;

        self.registry.create_channels(self.backend.as_ref()).map_err(|e| {
            error!(error = %e, "Failed to create channel sinks");
            match e {
                EngineError::Initialization(_) => e,
                other => EngineError::Initialization(format!("channel sinks: {}", other)),
            }
        })?;

        if let Some(previous) = previous_default {
            self.restore_default_sink(&previous);
        }

        self.initialized = true;
        info!(channels = self.registry.len(), "Audio engine initialized");

        if let Err(e) = self.sync_existing_streams() {
            warn!(error = %e, "Failed to sync existing streams");
        }

        for mix in Mix::ALL {
            if self.loopbacks.is_active(mix) {
                if let Err(e) = self.refresh_mix(mix) {
                    warn!(%mix, error = %e, "Failed to build mix");
                }
            }
        }

        self.emit(EngineEvent::ChannelsChanged);
        Ok(())
    }

    fn ensure_unassigned_sink(&mut self) -> Result<()> {
        let name = self.router.unassigned_sink().to_string();
        let module = match self.backend.sink_info(&name)? {
            Some(existing) => {
                info!(sink = %name, "Reusing existing unassigned sink");
                existing.owner_module
            }
            None => {
                let module = self.backend.create_sink(&name, "Duet Unassigned")?;
                info!(sink = %name, module, "Created unassigned sink");
                Some(module)
            }
        };
        self.backend.set_sink_mute(&name, true)?;
        self.unassigned_module = module;
        Ok(())
    }

    /// Creating null sinks can steal the server default; give it back
    fn restore_default_sink(&self, previous: &str) {
        let current = match self.backend.default_sink() {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "Could not read the default sink");
                return;
            }
        };
        let Some(current) = current else {
            return;
        };
        if current == previous || !self.is_reserved_sink(&current) {
            return;
        }
        match self.backend.set_default_sink(previous) {
            Ok(()) => info!(sink = %previous, "Restored default sink"),
            Err(e) => warn!(sink = %previous, error = %e, "Failed to restore default sink"),
        }
    }

    /// Release every module the engine created
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        info!("Shutting down audio engine");

        for mix in Mix::ALL {
            self.loopbacks.remove_all(self.backend.as_ref(), mix);
        }
        self.registry.teardown(self.backend.as_ref());

        if let Some(module) = self.unassigned_module.take() {
            if let Err(e) = self.backend.remove_module(module) {
                warn!(module, error = %e, "Failed to remove unassigned sink");
            }
        }

        self.router.clear();
        self.initialized = false;
        info!("Audio engine shut down");
    }

    // ---- channels ----

    pub fn list_channels(&self) -> Vec<Channel> {
        self.registry.list()
    }

    pub fn channel(&self, id: &ChannelId) -> Result<Channel> {
        self.registry.get(id).cloned()
    }

    /// Set a channel's basic sink level; returns the stored value
    pub fn set_channel_volume(&mut self, id: &ChannelId, volume: i32) -> Result<u8> {
        let volume = self.registry.set_volume(self.backend.as_ref(), id, volume)?;
        self.emit(EngineEvent::ChannelsChanged);
        Ok(volume)
    }

    pub fn set_channel_mute(&mut self, id: &ChannelId, muted: bool) -> Result<()> {
        self.registry.set_mute(self.backend.as_ref(), id, muted)?;
        self.emit(EngineEvent::ChannelsChanged);
        Ok(())
    }

    /// Set a channel's level in one mix; returns the stored value
    ///
    /// On an active mix the channel's edge is created on the first nonzero
    /// level, and an existing edge is updated in place. Otherwise the level is
    /// only stored.
    pub fn set_mix_level(&mut self, mix: Mix, id: &ChannelId, level: i32) -> Result<u8> {
        let previous = self.registry.get(id)?.mix_level(mix);
        let level = clamp_percent(level);
        self.registry.store_mix_level(mix, id, level)?;

        if let Err(e) = self.push_mix_level(mix, id, level) {
            self.registry.store_mix_level(mix, id, previous)?;
            return Err(e);
        }

        debug!(%mix, channel = %id, level, "Mix level set");
        self.emit(EngineEvent::ChannelsChanged);
        Ok(level)
    }

    fn push_mix_level(&mut self, mix: Mix, id: &ChannelId, level: u8) -> Result<()> {
        if !self.initialized || !self.loopbacks.is_active(mix) {
            return Ok(());
        }
        if self.loopbacks.edge(mix, id).is_none() {
            if level == 0 {
                return Ok(());
            }
            // Created at the stored level, nothing left to push
            self.loopbacks.ensure_edge(
                self.backend.as_ref(),
                &self.registry,
                &self.compositor,
                mix,
                id,
            )?;
            return Ok(());
        }
        self.compositor
            .reapply_channel(self.backend.as_ref(), &self.registry, &self.loopbacks, mix, id)?;
        Ok(())
    }

    pub fn set_personal_mix_level(&mut self, id: &ChannelId, level: i32) -> Result<u8> {
        self.set_mix_level(Mix::Personal, id, level)
    }

    pub fn set_stream_mix_level(&mut self, id: &ChannelId, level: i32) -> Result<u8> {
        self.set_mix_level(Mix::Stream, id, level)
    }

    /// Mute a channel in one mix only
    pub fn set_mix_mute(&mut self, mix: Mix, id: &ChannelId, muted: bool) -> Result<()> {
        self.registry.get(id)?;
        if self.initialized {
            self.loopbacks
                .set_edge_mute(self.backend.as_ref(), mix, id, muted)?;
        }
        self.registry.store_mix_muted(mix, id, muted)?;
        debug!(%mix, channel = %id, muted, "Mix mute set");
        self.emit(EngineEvent::ChannelsChanged);
        Ok(())
    }

    pub fn set_personal_mute(&mut self, id: &ChannelId, muted: bool) -> Result<()> {
        self.set_mix_mute(Mix::Personal, id, muted)
    }

    pub fn set_stream_mute(&mut self, id: &ChannelId, muted: bool) -> Result<()> {
        self.set_mix_mute(Mix::Stream, id, muted)
    }

    // ---- master volume ----

    pub fn master_volume(&self) -> u8 {
        self.compositor.master()
    }

    /// Store the master volume and push it to every live edge
    ///
    /// Edges that cannot be updated are logged and skipped.
    pub fn set_master_volume(&mut self, volume: i32) -> u8 {
        let master = self.compositor.set_master(volume);
        if self.initialized {
            self.compositor
                .reapply_all(self.backend.as_ref(), &self.registry, &self.loopbacks);
        }
        info!(master, "Master volume set");
        self.emit(EngineEvent::MasterVolumeChanged(master));
        master
    }

    // ---- mixes ----

    pub fn output_device(&self, mix: Mix) -> Option<String> {
        self.loopbacks.device(mix).map(str::to_string)
    }

    /// Select (or clear) the device a mix plays into
    ///
    /// Before initialization the device is only stored.
    pub fn set_output_device(&mut self, mix: Mix, device: Option<String>) -> Result<()> {
        if let Some(name) = device.as_deref() {
            if self.is_reserved_sink(name) {
                return Err(EngineError::ReservedDevice(name.to_string()));
            }
        }
        let previous = self.loopbacks.device(mix).map(str::to_string);
        let edges = self.edge_snapshot(mix);
        if !self.loopbacks.set_device(mix, device) {
            return Ok(());
        }

        if let Err(e) = self.apply_mix_change(mix) {
            self.loopbacks.set_device(mix, previous);
            self.recover_mix(mix, &edges);
            return Err(e);
        }
        self.emit(EngineEvent::MixesChanged);
        Ok(())
    }

    pub fn mix_enabled(&self, mix: Mix) -> bool {
        self.loopbacks.is_enabled(mix)
    }

    pub fn is_mix_active(&self, mix: Mix) -> bool {
        self.loopbacks.is_active(mix)
    }

    pub fn set_mix_enabled(&mut self, mix: Mix, enabled: bool) -> Result<()> {
        let edges = self.edge_snapshot(mix);
        if !self.loopbacks.set_enabled(mix, enabled) {
            return Ok(());
        }

        if let Err(e) = self.apply_mix_change(mix) {
            self.loopbacks.set_enabled(mix, !enabled);
            self.recover_mix(mix, &edges);
            return Err(e);
        }
        self.emit(EngineEvent::MixesChanged);
        Ok(())
    }

    fn apply_mix_change(&mut self, mix: Mix) -> Result<()> {
        if self.initialized {
            self.refresh_mix(mix)
        } else {
            Ok(())
        }
    }

    fn edge_snapshot(&self, mix: Mix) -> Vec<(ChannelId, MixEdge)> {
        self.loopbacks
            .edges(mix)
            .map(|(id, edge)| (id.clone(), *edge))
            .collect()
    }

    /// Bring a mix back in line with its restored settings when a failed
    /// change already touched its edges
    fn recover_mix(&mut self, mix: Mix, before: &[(ChannelId, MixEdge)]) {
        if !self.initialized || self.edge_snapshot(mix) == before {
            return;
        }
        warn!(%mix, "Mix change failed part way, restoring previous edges");
        if let Err(e) = self.refresh_mix(mix) {
            error!(%mix, error = %e, "Failed to restore mix after a rejected change");
        }
    }

    /// Bring a mix's edges in line with its device and enablement
    fn refresh_mix(&mut self, mix: Mix) -> Result<()> {
        if self.loopbacks.is_active(mix) {
            self.loopbacks.rebuild_all(
                self.backend.as_ref(),
                &self.registry,
                &self.compositor,
                mix,
            )?;
        } else {
            self.loopbacks.remove_all(self.backend.as_ref(), mix);
            info!(%mix, "Mix inactive, edges removed");
        }
        Ok(())
    }

    /// Sinks the user can choose as a mix output
    pub fn list_output_devices(&self) -> Result<Vec<SinkDescriptor>> {
        let devices = self
            .backend
            .list_sinks()?
            .into_iter()
            .filter(|sink| !self.is_reserved_sink(&sink.id))
            .collect();
        Ok(devices)
    }

    // ---- streams ----

    pub fn list_streams(&self) -> Result<Vec<Stream>> {
        self.router
            .list_streams(self.backend.as_ref(), &self.loopbacks.tracked_modules())
    }

    pub fn stream_channel(&self, stream: StreamId) -> Option<ChannelId> {
        self.router.channel_of(stream).cloned()
    }

    /// A stream that exists and is user content
    fn routable_stream(&self, stream: StreamId) -> Result<StreamInfo> {
        let info = self
            .backend
            .stream_info(stream)?
            .ok_or(EngineError::UnknownStream(stream))?;
        if classify(&info, &self.loopbacks.tracked_modules()) != StreamClass::Content {
            return Err(EngineError::UnknownStream(stream));
        }
        Ok(info)
    }

    pub fn move_stream_to_channel(&mut self, stream: StreamId, channel: &ChannelId) -> Result<()> {
        self.registry.get(channel)?;
        self.routable_stream(stream)?;

        let rule = self.router.move_to_channel(
            self.backend.as_ref(),
            &self.registry,
            &mut self.rules,
            stream,
            channel,
        )?;
        if rule.is_some() {
            self.emit(EngineEvent::RoutingRulesChanged);
        }
        self.emit(EngineEvent::StreamsChanged);
        Ok(())
    }

    pub fn unassign_stream(&mut self, stream: StreamId) -> Result<()> {
        self.routable_stream(stream)?;
        self.router.unassign(self.backend.as_ref(), stream)?;
        self.emit(EngineEvent::StreamsChanged);
        Ok(())
    }

    /// Reconcile assignments with the streams already on the graph
    pub fn sync_existing_streams(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        let changed = self.router.sync_existing(
            self.backend.as_ref(),
            &self.registry,
            &self.rules,
            &self.loopbacks.tracked_modules(),
        )?;
        info!(assigned = self.router.assignment_count(), "Synced existing streams");
        if changed {
            self.emit(EngineEvent::StreamsChanged);
        }
        Ok(())
    }

    /// Re-run rule matching for every visible stream; returns how many moved
    pub fn apply_routing_rules_to_existing_streams(&mut self) -> Result<usize> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        let moved = self.router.apply_rules_to_existing(
            self.backend.as_ref(),
            &self.registry,
            &self.rules,
            &self.loopbacks.tracked_modules(),
        )?;
        if moved > 0 {
            self.emit(EngineEvent::StreamsChanged);
        }
        Ok(moved)
    }

    // ---- rules ----

    pub fn routing_rules(&self) -> Vec<RoutingRule> {
        self.rules.rules()
    }

    pub fn add_routing_rule(&mut self, pattern: impl Into<String>, channel: ChannelId) {
        self.rules.add(pattern, channel);
        self.emit(EngineEvent::RoutingRulesChanged);
    }

    pub fn remove_routing_rule(&mut self, pattern: &str) -> bool {
        let removed = self.rules.remove(pattern);
        if removed {
            self.emit(EngineEvent::RoutingRulesChanged);
        }
        removed
    }

    // ---- monitor callbacks ----

    /// A stream announced as new has had time to settle
    ///
    /// A stream that has gone away in the meantime is ignored.
    pub fn handle_stream_settled(&mut self, stream: StreamId) -> Result<Option<RouteOutcome>> {
        if !self.initialized {
            return Ok(None);
        }
        let Some(info) = self.backend.stream_info(stream)? else {
            debug!(stream, "Stream vanished before it settled");
            return Ok(None);
        };

        let class = classify(&info, &self.loopbacks.tracked_modules());
        if class != StreamClass::Content {
            debug!(stream, app = %info.app_name, ?class, "Ignoring stream");
            return Ok(None);
        }

        let outcome = self
            .router
            .route(self.backend.as_ref(), &self.registry, &self.rules, &info)?;
        self.emit(EngineEvent::StreamAdded {
            id: stream,
            app_name: info.app_name,
        });
        Ok(Some(outcome))
    }

    pub fn handle_stream_removed(&mut self, stream: StreamId) {
        if self.router.forget(stream) {
            debug!(stream, "Dropped assignment of removed stream");
        }
        self.emit(EngineEvent::StreamRemoved(stream));
        self.emit(EngineEvent::StreamsChanged);
    }

    pub fn handle_streams_changed(&self) {
        self.emit(EngineEvent::StreamsChanged);
    }

    // ---- persistence ----

    pub fn setup_complete(&self) -> bool {
        self.setup_complete
    }

    pub fn set_setup_complete(&mut self, complete: bool) {
        if self.setup_complete != complete {
            self.setup_complete = complete;
            self.emit(EngineEvent::SetupChanged);
        }
    }

    /// Snapshot of everything worth saving
    pub fn state(&self) -> EngineState {
        let channels = self
            .registry
            .channels()
            .map(|c| {
                let settings = ChannelSettings {
                    volume: c.volume,
                    muted: c.muted,
                    personal_volume: c.personal_volume,
                    personal_muted: c.personal_muted,
                    stream_volume: c.stream_volume,
                    stream_muted: c.stream_muted,
                };
                (c.id.clone(), settings)
            })
            .collect();

        EngineState {
            master_volume: self.compositor.master(),
            setup_complete: self.setup_complete,
            personal_device: self.output_device(Mix::Personal),
            stream_device: self.output_device(Mix::Stream),
            personal_enabled: self.loopbacks.is_enabled(Mix::Personal),
            stream_enabled: self.loopbacks.is_enabled(Mix::Stream),
            rules: self.rules.rules(),
            channels,
        }
    }

    /// Replay a saved state
    ///
    /// Persistent-change notifications are suppressed while this runs. Mixes
    /// are rebuilt through the same muted sequence as a device change. Rules
    /// replace the current set and are then applied to the streams already
    /// playing.
    pub fn apply_state(&mut self, state: &EngineState) -> Result<()> {
        if !self.initialized {
            return Err(EngineError::NotInitialized);
        }
        info!(
            rules = state.rules.len(),
            channels = state.channels.len(),
            "Applying saved state"
        );

        self.loading = true;
        self.apply_state_inner(state);
        self.loading = false;

        self.emit(EngineEvent::StateApplied);
        Ok(())
    }

    fn apply_state_inner(&mut self, state: &EngineState) {
        let backend = Arc::clone(&self.backend);

        for (id, settings) in &state.channels {
            if !self.registry.contains(id) {
                warn!(channel = %id, "Saved settings for unknown channel ignored");
                continue;
            }
            if let Err(e) = self.registry.set_volume(backend.as_ref(), id, settings.volume as i32) {
                warn!(channel = %id, error = %e, "Failed to restore channel volume");
            }
            if let Err(e) = self.registry.set_mute(backend.as_ref(), id, settings.muted) {
                warn!(channel = %id, error = %e, "Failed to restore channel mute");
            }
            let stored = [
                (Mix::Personal, settings.personal_volume, settings.personal_muted),
                (Mix::Stream, settings.stream_volume, settings.stream_muted),
            ];
            for (mix, level, muted) in stored {
                let restored = self
                    .registry
                    .store_mix_level(mix, id, clamp_percent(level as i32))
                    .and_then(|_| self.registry.store_mix_muted(mix, id, muted));
                if let Err(e) = restored {
                    warn!(%mix, channel = %id, error = %e, "Failed to restore mix settings");
                }
            }
        }

        self.compositor.set_master(state.master_volume as i32);

        let personal = state.personal_device.clone().filter(|d| !self.is_reserved_sink(d));
        let stream = state.stream_device.clone().filter(|d| !self.is_reserved_sink(d));
        self.loopbacks.set_device(Mix::Personal, personal);
        self.loopbacks.set_device(Mix::Stream, stream);
        self.loopbacks.set_enabled(Mix::Personal, state.personal_enabled);
        self.loopbacks.set_enabled(Mix::Stream, state.stream_enabled);

        for mix in Mix::ALL {
            if let Err(e) = self.refresh_mix(mix) {
                warn!(%mix, error = %e, "Failed to restore mix");
            }
        }

        self.rules = RoutingRuleStore::new();
        for rule in &state.rules {
            self.rules.add(rule.pattern.clone(), rule.channel.clone());
        }
        self.setup_complete = state.setup_complete;

        match self.apply_routing_rules_to_existing_streams() {
            Ok(moved) => info!(moved, "Routing rules applied to existing streams"),
            Err(e) => warn!(error = %e, "Failed to apply routing rules to existing streams"),
        }
    }
}

/// Shared handle to the engine
///
/// The lock is held for the whole of each operation. Blocking engine work is
/// moved onto tokio's blocking pool.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Mutex<Engine>>,
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    /// Lock the engine from synchronous code
    pub fn lock(&self) -> MutexGuard<'_, Engine> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a closure against the engine on the blocking pool
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Engine) -> T + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut engine = inner.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut engine)
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.lock().subscribe()
    }
}
