//! In-memory audio server for tests
//!
//! [`FakeBackend`] keeps sinks, loopback modules and playback streams in a
//! table, records every call it receives, and can be told to fail a given
//! operation once.

use crate::domain::backend::{
    AudioBackend, BackendError, BackendEvent, EventFeed, EventKind, LoopbackParams, ModuleId,
    Result, SinkDescriptor, SinkInfo, StreamId, StreamInfo,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A call received by the fake, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateSink(String),
    RemoveModule(ModuleId),
    SinkInfo(String),
    SetSinkVolume(String, u8),
    SetSinkMute(String, bool),
    ListSinks,
    DefaultSink,
    SetDefaultSink(String),
    CreateLoopback(String, String),
    FindMixingInput(ModuleId),
    SetInputVolume(StreamId, u8),
    SetInputMute(StreamId, bool),
    MoveStream(StreamId, String),
    ListStreams,
    Subscribe,
}

/// Volume and mute of a sink-input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputState {
    pub volume: u8,
    pub muted: bool,
}

#[derive(Debug, Clone)]
struct FakeSink {
    index: u32,
    name: String,
    description: String,
    module: Option<ModuleId>,
    volume: u8,
    muted: bool,
}

#[derive(Debug, Clone)]
struct FakeInput {
    info: StreamInfo,
    state: InputState,
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    sinks: Vec<FakeSink>,
    inputs: BTreeMap<StreamId, FakeInput>,
    loopbacks: BTreeMap<ModuleId, Option<StreamId>>,
    default_sink: Option<String>,
    calls: Vec<Call>,
    /// Armed failures: operation name and calls to let through first
    failing: HashMap<String, usize>,
    hide_inputs: bool,
    steal_default: bool,
    feed: Option<mpsc::UnboundedSender<BackendEvent>>,
}

impl State {
    fn allocate(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn sink(&self, name: &str) -> Option<&FakeSink> {
        self.sinks.iter().find(|s| s.name == name)
    }

    fn sink_mut(&mut self, name: &str) -> Result<&mut FakeSink> {
        self.sinks
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| BackendError::NotFound(format!("sink {}", name)))
    }

    fn input_mut(&mut self, id: StreamId) -> Result<&mut FakeInput> {
        self.inputs
            .get_mut(&id)
            .ok_or_else(|| BackendError::NotFound(format!("sink-input {}", id)))
    }

    /// Record the call, then fail it if it was armed
    fn enter(&mut self, op: &str, call: Call) -> Result<()> {
        self.calls.push(call);
        match self.failing.get(op).copied() {
            Some(0) => {
                self.failing.remove(op);
                return Err(BackendError::failed(op, "injected failure"));
            }
            Some(skip) => {
                self.failing.insert(op.to_string(), skip - 1);
            }
            None => {}
        }
        Ok(())
    }
}

/// Scriptable in-memory [`AudioBackend`]
#[derive(Debug, Default)]
pub struct FakeBackend {
    state: Mutex<State>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a hardware sink not owned by any module
    pub fn add_output_device(&self, name: &str) -> u32 {
        let mut state = self.state();
        let index = state.allocate();
        state.sinks.push(FakeSink {
            index,
            name: name.to_string(),
            description: format!("{} (hardware)", name),
            module: None,
            volume: 100,
            muted: false,
        });
        index
    }

    /// Add a playback stream that is not playing into any known sink
    pub fn add_stream(&self, app_name: &str, process_name: &str, media_name: &str) -> StreamId {
        self.insert_stream(app_name, process_name, media_name, None)
    }

    /// Add a playback stream created by a module
    pub fn add_stream_from_module(
        &self,
        app_name: &str,
        process_name: &str,
        media_name: &str,
        module: ModuleId,
    ) -> StreamId {
        self.insert_stream(app_name, process_name, media_name, Some(module))
    }

    fn insert_stream(
        &self,
        app_name: &str,
        process_name: &str,
        media_name: &str,
        owner_module: Option<ModuleId>,
    ) -> StreamId {
        let mut state = self.state();
        let id = state.allocate();
        let info = StreamInfo {
            id,
            app_name: app_name.to_string(),
            process_name: process_name.to_string(),
            media_name: media_name.to_string(),
            sink: None,
            owner_module,
        };
        state.inputs.insert(
            id,
            FakeInput {
                info,
                state: InputState {
                    volume: 100,
                    muted: false,
                },
            },
        );
        id
    }

    pub fn remove_stream(&self, id: StreamId) -> bool {
        self.state().inputs.remove(&id).is_some()
    }

    /// Name of the sink a stream plays into
    pub fn stream_sink_name(&self, id: StreamId) -> Option<String> {
        let state = self.state();
        let sink = state.inputs.get(&id)?.info.sink?;
        state
            .sinks
            .iter()
            .find(|s| s.index == sink)
            .map(|s| s.name.clone())
    }

    pub fn input(&self, id: StreamId) -> Option<InputState> {
        self.state().inputs.get(&id).map(|i| i.state)
    }

    pub fn has_sink(&self, name: &str) -> bool {
        self.state().sink(name).is_some()
    }

    pub fn sink_count_named(&self, name: &str) -> usize {
        self.state().sinks.iter().filter(|s| s.name == name).count()
    }

    /// Number of loopback modules currently loaded
    pub fn loopback_count(&self) -> usize {
        self.state().loopbacks.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Make the next call of `op` (a trait method name) fail
    pub fn fail_next(&self, op: &str) {
        self.fail_after(op, 0);
    }

    /// Fail the call to `op` that follows `successes` successful ones
    pub fn fail_after(&self, op: &str, successes: usize) {
        self.state().failing.insert(op.to_string(), successes);
    }

    /// While set, new loopbacks get no findable sink-input
    pub fn hide_mixing_inputs(&self, hide: bool) {
        self.state().hide_inputs = hide;
    }

    /// Make every newly created null sink become the default sink
    pub fn steal_default_on_create(&self, steal: bool) {
        self.state().steal_default = steal;
    }

    /// Push an event into the subscription feed, if one is open
    pub fn emit(&self, kind: EventKind, stream: StreamId) {
        if let Some(feed) = &self.state().feed {
            let _ = feed.send(BackendEvent::new(kind, stream));
        }
    }
}

impl AudioBackend for FakeBackend {
    fn create_sink(&self, name: &str, description: &str) -> Result<ModuleId> {
        let mut state = self.state();
        state.enter("create_sink", Call::CreateSink(name.to_string()))?;
        let module = state.allocate();
        let index = state.allocate();
        state.sinks.push(FakeSink {
            index,
            name: name.to_string(),
            description: description.to_string(),
            module: Some(module),
            volume: 100,
            muted: false,
        });
        if state.steal_default {
            state.default_sink = Some(name.to_string());
        }
        Ok(module)
    }

    fn remove_module(&self, module: ModuleId) -> Result<()> {
        let mut state = self.state();
        state.enter("remove_module", Call::RemoveModule(module))?;

        if let Some(input) = state.loopbacks.remove(&module) {
            if let Some(input) = input {
                state.inputs.remove(&input);
            }
            return Ok(());
        }

        let before = state.sinks.len();
        state.sinks.retain(|s| s.module != Some(module));
        if state.sinks.len() == before {
            return Err(BackendError::NotFound(format!("module {}", module)));
        }
        Ok(())
    }

    fn sink_info(&self, name: &str) -> Result<Option<SinkInfo>> {
        let mut state = self.state();
        state.enter("sink_info", Call::SinkInfo(name.to_string()))?;
        Ok(state.sink(name).map(|s| SinkInfo {
            index: s.index,
            name: s.name.clone(),
            owner_module: s.module,
            volume: s.volume,
            muted: s.muted,
        }))
    }

    fn set_sink_volume(&self, name: &str, percent: u8) -> Result<()> {
        let mut state = self.state();
        state.enter("set_sink_volume", Call::SetSinkVolume(name.to_string(), percent))?;
        state.sink_mut(name)?.volume = percent;
        Ok(())
    }

    fn set_sink_mute(&self, name: &str, muted: bool) -> Result<()> {
        let mut state = self.state();
        state.enter("set_sink_mute", Call::SetSinkMute(name.to_string(), muted))?;
        state.sink_mut(name)?.muted = muted;
        Ok(())
    }

    fn list_sinks(&self) -> Result<Vec<SinkDescriptor>> {
        let mut state = self.state();
        state.enter("list_sinks", Call::ListSinks)?;
        Ok(state
            .sinks
            .iter()
            .map(|s| SinkDescriptor {
                id: s.name.clone(),
                name: s.name.clone(),
                description: s.description.clone(),
            })
            .collect())
    }

    fn default_sink(&self) -> Result<Option<String>> {
        let mut state = self.state();
        state.enter("default_sink", Call::DefaultSink)?;
        Ok(state.default_sink.clone())
    }

    fn set_default_sink(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("set_default_sink", Call::SetDefaultSink(name.to_string()))?;
        if state.sink(name).is_none() {
            return Err(BackendError::NotFound(format!("sink {}", name)));
        }
        state.default_sink = Some(name.to_string());
        Ok(())
    }

    fn create_loopback(&self, source: &str, sink: &str, _params: LoopbackParams) -> Result<ModuleId> {
        let mut state = self.state();
        state.enter(
            "create_loopback",
            Call::CreateLoopback(source.to_string(), sink.to_string()),
        )?;
        let sink_index = state
            .sink(sink)
            .map(|s| s.index)
            .ok_or_else(|| BackendError::NotFound(format!("sink {}", sink)))?;
        let source_sink = source.trim_end_matches(".monitor");
        if state.sink(source_sink).is_none() {
            return Err(BackendError::NotFound(format!("source {}", source)));
        }

        let module = state.allocate();
        let input = if state.hide_inputs {
            None
        } else {
            let id = state.allocate();
            let info = StreamInfo {
                id,
                app_name: String::new(),
                process_name: String::new(),
                media_name: format!("Loopback from {}", source),
                sink: Some(sink_index),
                owner_module: Some(module),
            };
            state.inputs.insert(
                id,
                FakeInput {
                    info,
                    state: InputState {
                        volume: 100,
                        muted: false,
                    },
                },
            );
            Some(id)
        };
        state.loopbacks.insert(module, input);
        Ok(module)
    }

    fn find_mixing_input(&self, module: ModuleId) -> Result<Option<StreamId>> {
        let mut state = self.state();
        state.enter("find_mixing_input", Call::FindMixingInput(module))?;
        Ok(state.loopbacks.get(&module).copied().flatten())
    }

    fn set_mixing_input_volume(&self, input: StreamId, percent: u8) -> Result<()> {
        let mut state = self.state();
        state.enter("set_mixing_input_volume", Call::SetInputVolume(input, percent))?;
        state.input_mut(input)?.state.volume = percent;
        Ok(())
    }

    fn set_mixing_input_mute(&self, input: StreamId, muted: bool) -> Result<()> {
        let mut state = self.state();
        state.enter("set_mixing_input_mute", Call::SetInputMute(input, muted))?;
        state.input_mut(input)?.state.muted = muted;
        Ok(())
    }

    fn move_stream(&self, stream: StreamId, sink: &str) -> Result<()> {
        let mut state = self.state();
        state.enter("move_stream", Call::MoveStream(stream, sink.to_string()))?;
        let index = state
            .sink(sink)
            .map(|s| s.index)
            .ok_or_else(|| BackendError::NotFound(format!("sink {}", sink)))?;
        state.input_mut(stream)?.info.sink = Some(index);
        Ok(())
    }

    fn list_streams(&self) -> Result<Vec<StreamInfo>> {
        let mut state = self.state();
        state.enter("list_streams", Call::ListStreams)?;
        Ok(state.inputs.values().map(|i| i.info.clone()).collect())
    }

    fn subscribe(&self) -> Result<EventFeed> {
        let mut state = self.state();
        state.enter("subscribe", Call::Subscribe)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.feed = Some(tx);
        Ok(rx)
    }
}
