//! [`AudioBackend`] over `pactl`
//!
//! Works against PulseAudio and against PipeWire through pipewire-pulse.
//! Listing goes through `pactl -f json`; every call is bounded by the
//! configured timeout.

use crate::pulse::command;
use crate::pulse::json;
use crate::pulse::subscribe;
use duet_core::domain::backend::{
    AudioBackend, EventFeed, LoopbackParams, ModuleId, Result, SinkDescriptor, SinkInfo, StreamId,
    StreamInfo,
};
use std::time::Duration;
use tracing::debug;

const PACTL: &str = "pactl";

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}

/// Module arguments of a stereo null sink
///
/// Module arguments are split on whitespace, so spaces in the description
/// become dashes.
pub fn null_sink_args(name: &str, description: &str) -> Vec<String> {
    vec![
        "load-module".to_string(),
        "module-null-sink".to_string(),
        format!("sink_name={}", name),
        format!("sink_properties=device.description={}", description.replace(' ', "-")),
        "channel_map=front-left,front-right".to_string(),
    ]
}

/// Module arguments of a loopback from `source` into `sink`
pub fn loopback_args(source: &str, sink: &str, params: LoopbackParams) -> Vec<String> {
    let mut args = vec![
        "load-module".to_string(),
        "module-loopback".to_string(),
        format!("source={}", source),
        format!("sink={}", sink),
        format!("latency_msec={}", params.latency_ms),
    ];
    if params.pinned {
        args.push("source_dont_move=true".to_string());
        args.push("sink_dont_move=true".to_string());
    }
    if params.no_remix {
        args.push("remix=false".to_string());
        args.push("adjust_time=0".to_string());
    }
    args
}

/// Talks to the sound server through the `pactl` tool
#[derive(Debug, Clone)]
pub struct PactlBackend {
    program: String,
    timeout: Duration,
}

impl PactlBackend {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: PACTL.to_string(),
            timeout,
        }
    }

    /// Use a different executable (a wrapper or a test double)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn pactl(&self, args: Vec<String>) -> Result<String> {
        command::run(&self.program, &args, self.timeout)
    }

    fn pactl_json(&self, what: &str) -> Result<String> {
        self.pactl(vec![
            "-f".to_string(),
            "json".to_string(),
            "list".to_string(),
            what.to_string(),
        ])
    }

    fn sink_infos(&self) -> Result<Vec<SinkInfo>> {
        json::parse_sink_infos(&self.pactl_json("sinks")?)
    }
}

impl AudioBackend for PactlBackend {
    fn create_sink(&self, name: &str, description: &str) -> Result<ModuleId> {
        let module = json::parse_module_index(&self.pactl(null_sink_args(name, description))?)?;
        debug!(sink = %name, module, "Loaded null sink");
        Ok(module)
    }

    fn remove_module(&self, module: ModuleId) -> Result<()> {
        self.pactl(vec!["unload-module".to_string(), module.to_string()])?;
        Ok(())
    }

    fn sink_info(&self, name: &str) -> Result<Option<SinkInfo>> {
        Ok(self.sink_infos()?.into_iter().find(|s| s.name == name))
    }

    fn set_sink_volume(&self, name: &str, percent: u8) -> Result<()> {
        self.pactl(vec![
            "set-sink-volume".to_string(),
            name.to_string(),
            format!("{}%", percent),
        ])?;
        Ok(())
    }

    fn set_sink_mute(&self, name: &str, muted: bool) -> Result<()> {
        self.pactl(vec![
            "set-sink-mute".to_string(),
            name.to_string(),
            flag(muted).to_string(),
        ])?;
        Ok(())
    }

    fn list_sinks(&self) -> Result<Vec<SinkDescriptor>> {
        json::parse_sink_descriptors(&self.pactl_json("sinks")?)
    }

    fn default_sink(&self) -> Result<Option<String>> {
        let name = self.pactl(vec!["get-default-sink".to_string()])?;
        let name = name.trim();
        Ok((!name.is_empty()).then(|| name.to_string()))
    }

    fn set_default_sink(&self, name: &str) -> Result<()> {
        self.pactl(vec!["set-default-sink".to_string(), name.to_string()])?;
        Ok(())
    }

    fn create_loopback(&self, source: &str, sink: &str, params: LoopbackParams) -> Result<ModuleId> {
        let module = json::parse_module_index(&self.pactl(loopback_args(source, sink, params))?)?;
        debug!(%source, %sink, module, "Loaded loopback");
        Ok(module)
    }

    fn find_mixing_input(&self, module: ModuleId) -> Result<Option<StreamId>> {
        Ok(self
            .list_streams()?
            .into_iter()
            .find(|s| s.owner_module == Some(module))
            .map(|s| s.id))
    }

    fn set_mixing_input_volume(&self, input: StreamId, percent: u8) -> Result<()> {
        self.pactl(vec![
            "set-sink-input-volume".to_string(),
            input.to_string(),
            format!("{}%", percent),
        ])?;
        Ok(())
    }

    fn set_mixing_input_mute(&self, input: StreamId, muted: bool) -> Result<()> {
        self.pactl(vec![
            "set-sink-input-mute".to_string(),
            input.to_string(),
            flag(muted).to_string(),
        ])?;
        Ok(())
    }

    fn move_stream(&self, stream: StreamId, sink: &str) -> Result<()> {
        self.pactl(vec![
            "move-sink-input".to_string(),
            stream.to_string(),
            sink.to_string(),
        ])?;
        Ok(())
    }

    fn list_streams(&self) -> Result<Vec<StreamInfo>> {
        json::parse_sink_inputs(&self.pactl_json("sink-inputs")?)
    }

    fn subscribe(&self) -> Result<EventFeed> {
        subscribe::spawn_feed(&self.program)
    }
}
