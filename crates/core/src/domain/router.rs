//! Stream classification and routing
//!
//! Every playback stream is either the engine's own loopback traffic, a system
//! stream, or user content. Only content is ever matched against routing rules
//! or shown to the user. Content that matches no rule is parked on the silent
//! unassigned sink.

use crate::domain::backend::{AudioBackend, BackendError, ModuleId, StreamId, StreamInfo};
use crate::domain::channel::{ChannelId, ChannelRegistry};
use crate::domain::error::{EngineError, Result};
use crate::domain::rules::{RoutingRule, RoutingRuleStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Default name of the silent sink unrouted streams are parked on
pub const UNASSIGNED_SINK: &str = "duet_unassigned";

const LOOPBACK_MARKER: &str = "loopback";

/// Utilities whose streams are never routed
const SYSTEM_STREAMS: [&str; 6] = [
    "speech-dispatcher",
    "speech_dispatcher",
    "spd-say",
    "pipewire",
    "pulseaudio volume control",
    "pavucontrol",
];

/// What a stream is, as far as routing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    /// Produced by one of our own loopback edges
    SelfTraffic,
    /// System noise or a known utility
    System,
    /// User audio that should be routed
    Content,
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

/// Classify a stream
///
/// `own_modules` are the modules currently allocated for mix edges.
pub fn classify(info: &StreamInfo, own_modules: &HashSet<ModuleId>) -> StreamClass {
    if info.owner_module.is_some_and(|m| own_modules.contains(&m)) {
        return StreamClass::SelfTraffic;
    }

    let names = [&info.app_name, &info.process_name, &info.media_name];
    if names.iter().any(|n| contains_ignore_case(n, LOOPBACK_MARKER)) {
        return StreamClass::SelfTraffic;
    }

    if info.app_name.is_empty() && info.process_name.is_empty() {
        return StreamClass::System;
    }

    let denied = SYSTEM_STREAMS.iter().any(|s| {
        contains_ignore_case(&info.app_name, s) || contains_ignore_case(&info.process_name, s)
    });
    if denied {
        return StreamClass::System;
    }

    StreamClass::Content
}

/// A routable stream as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub app_name: String,
    pub process_name: String,
    pub media_name: String,
    pub assigned_channel: Option<ChannelId>,
}

/// Where a stream ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Channel(ChannelId),
    Unassigned,
}

/// Pattern that will match future instances of the same application
fn rule_pattern_for(info: &StreamInfo) -> Option<String> {
    [&info.process_name, &info.app_name]
        .into_iter()
        .find(|name| !name.is_empty())
        .map(|name| regex::escape(name))
}

/// Tracks which channel each stream is assigned to and moves streams around
#[derive(Debug, Clone)]
pub struct StreamRouter {
    unassigned_sink: String,
    assignments: HashMap<StreamId, ChannelId>,
}

impl StreamRouter {
    pub fn new(unassigned_sink: impl Into<String>) -> Self {
        Self {
            unassigned_sink: unassigned_sink.into(),
            assignments: HashMap::new(),
        }
    }

    pub fn unassigned_sink(&self) -> &str {
        &self.unassigned_sink
    }

    pub fn channel_of(&self, stream: StreamId) -> Option<&ChannelId> {
        self.assignments.get(&stream)
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }

    /// Drop the assignment of a stream that went away
    pub fn forget(&mut self, stream: StreamId) -> bool {
        self.assignments.remove(&stream).is_some()
    }

    pub fn clear(&mut self) {
        self.assignments.clear();
    }

    /// Route a content stream by the first matching rule, or park it
    pub fn route(
        &mut self,
        backend: &dyn AudioBackend,
        registry: &ChannelRegistry,
        rules: &RoutingRuleStore,
        info: &StreamInfo,
    ) -> Result<RouteOutcome> {
        if let Some(rule) = rules.first_match(&info.app_name, &info.process_name) {
            match registry.get(&rule.channel) {
                Ok(channel) => {
                    backend.move_stream(info.id, &channel.sink_name)?;
                    self.assignments.insert(info.id, rule.channel.clone());
                    info!(
                        stream = info.id,
                        app = %info.app_name,
                        channel = %rule.channel,
                        pattern = %rule.pattern,
                        "Auto-routed stream"
                    );
                    return Ok(RouteOutcome::Channel(rule.channel.clone()));
                }
                Err(_) => {
                    warn!(pattern = %rule.pattern, channel = %rule.channel, "Routing rule targets an unknown channel");
                }
            }
        }

        backend.move_stream(info.id, &self.unassigned_sink)?;
        self.assignments.remove(&info.id);
        info!(stream = info.id, app = %info.app_name, "Moved unassigned stream to silent sink");
        Ok(RouteOutcome::Unassigned)
    }

    /// Manually assign a stream to a channel
    ///
    /// A rule is synthesised from the stream's process name (or app name) so
    /// that future instances route on their own. Returns that rule.
    pub fn move_to_channel(
        &mut self,
        backend: &dyn AudioBackend,
        registry: &ChannelRegistry,
        rules: &mut RoutingRuleStore,
        stream: StreamId,
        channel_id: &ChannelId,
    ) -> Result<Option<RoutingRule>> {
        let channel = registry.get(channel_id)?;
        backend
            .move_stream(stream, &channel.sink_name)
            .map_err(|e| unknown_stream_or(e, stream))?;
        self.assignments.insert(stream, channel_id.clone());
        info!(stream, channel = %channel_id, "Moved stream to channel");

        let pattern = match backend.stream_info(stream) {
            Ok(Some(info)) => rule_pattern_for(&info),
            Ok(None) => None,
            Err(e) => {
                warn!(stream, error = %e, "Could not read stream to derive a routing rule");
                None
            }
        };

        Ok(pattern.map(|pattern| {
            rules.add(pattern.clone(), channel_id.clone());
            RoutingRule::new(pattern, channel_id.clone())
        }))
    }

    /// Park a stream on the silent sink without touching rules
    pub fn unassign(&mut self, backend: &dyn AudioBackend, stream: StreamId) -> Result<()> {
        backend
            .move_stream(stream, &self.unassigned_sink)
            .map_err(|e| unknown_stream_or(e, stream))?;
        self.assignments.remove(&stream);
        info!(stream, "Unassigned stream to silent sink");
        Ok(())
    }

    /// Reconcile with the streams already on the graph
    ///
    /// Streams already playing into one of our channel sinks keep that channel.
    /// Everything else goes through the same path as a newly appeared stream.
    /// Returns whether any assignment changed.
    pub fn sync_existing(
        &mut self,
        backend: &dyn AudioBackend,
        registry: &ChannelRegistry,
        rules: &RoutingRuleStore,
        own_modules: &HashSet<ModuleId>,
    ) -> Result<bool> {
        let mut changed = false;

        for info in backend.list_streams()? {
            if let Some(channel) = info.sink.and_then(|sink| registry.channel_for_sink(sink)) {
                if self.assignments.get(&info.id) != Some(channel) {
                    self.assignments.insert(info.id, channel.clone());
                    changed = true;
                }
                debug!(stream = info.id, %channel, "Existing stream already on channel");
                continue;
            }

            if classify(&info, own_modules) != StreamClass::Content {
                continue;
            }

            let had_assignment = self.assignments.contains_key(&info.id);
            match self.route(backend, registry, rules, &info) {
                Ok(RouteOutcome::Channel(_)) => changed = true,
                Ok(RouteOutcome::Unassigned) => changed |= had_assignment,
                Err(e) => warn!(stream = info.id, error = %e, "Failed to route existing stream"),
            }
        }

        Ok(changed)
    }

    /// Re-run rule matching for every visible stream
    ///
    /// Streams matching no rule are left where they are. Returns the number of
    /// streams moved.
    pub fn apply_rules_to_existing(
        &mut self,
        backend: &dyn AudioBackend,
        registry: &ChannelRegistry,
        rules: &RoutingRuleStore,
        own_modules: &HashSet<ModuleId>,
    ) -> Result<usize> {
        if rules.is_empty() {
            debug!("No routing rules to apply");
            return Ok(0);
        }

        let mut moved = 0;
        for info in backend.list_streams()? {
            if classify(&info, own_modules) != StreamClass::Content {
                continue;
            }
            let Some(rule) = rules.first_match(&info.app_name, &info.process_name) else {
                continue;
            };
            let Ok(channel) = registry.get(&rule.channel) else {
                continue;
            };
            match backend.move_stream(info.id, &channel.sink_name) {
                Ok(()) => {
                    self.assignments.insert(info.id, rule.channel.clone());
                    info!(app = %info.app_name, channel = %rule.channel, "Routed existing stream");
                    moved += 1;
                }
                Err(e) => warn!(stream = info.id, error = %e, "Failed to route existing stream"),
            }
        }

        Ok(moved)
    }

    /// Visible content streams with their assignments
    pub fn list_streams(
        &self,
        backend: &dyn AudioBackend,
        own_modules: &HashSet<ModuleId>,
    ) -> Result<Vec<Stream>> {
        let streams = backend
            .list_streams()?
            .into_iter()
            .filter(|info| classify(info, own_modules) == StreamClass::Content)
            .map(|info| Stream {
                assigned_channel: self.assignments.get(&info.id).cloned(),
                id: info.id,
                app_name: info.app_name,
                process_name: info.process_name,
                media_name: info.media_name,
            })
            .collect();
        Ok(streams)
    }
}

fn unknown_stream_or(err: BackendError, stream: StreamId) -> EngineError {
    match err {
        BackendError::NotFound(_) => EngineError::UnknownStream(stream),
        other => other.into(),
    }
}
