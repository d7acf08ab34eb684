//! Typed records from `pactl -f json` output

use duet_core::domain::backend::{BackendError, Result, SinkDescriptor, SinkInfo, StreamInfo};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Object indexes are numbers, sometimes quoted; `u32::MAX` means none
fn optional_index<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let index = value.and_then(|v| match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    });
    Ok(index
        .and_then(|n| u32::try_from(n).ok())
        .filter(|&n| n != u32::MAX))
}

#[derive(Debug, Deserialize)]
struct ChannelVolume {
    value_percent: String,
}

#[derive(Debug, Deserialize)]
struct RawSink {
    index: u32,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, deserialize_with = "optional_index")]
    owner_module: Option<u32>,
    #[serde(default)]
    mute: bool,
    #[serde(default)]
    volume: BTreeMap<String, ChannelVolume>,
}

#[derive(Debug, Deserialize)]
struct RawSinkInput {
    index: u32,
    #[serde(default, deserialize_with = "optional_index")]
    owner_module: Option<u32>,
    #[serde(default, deserialize_with = "optional_index")]
    sink: Option<u32>,
    #[serde(default)]
    properties: HashMap<String, Value>,
}

impl RawSinkInput {
    fn property(&self, key: &str) -> String {
        self.properties
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// "65%" -> 65, saturating above 255
fn parse_percent(text: &str) -> Option<u8> {
    let n: u32 = text.trim().trim_end_matches('%').trim().parse().ok()?;
    Some(n.min(u8::MAX as u32) as u8)
}

fn parse<'a, T: Deserialize<'a>>(json: &'a str) -> Result<T> {
    serde_json::from_str(json).map_err(|e| BackendError::Parse(e.to_string()))
}

fn sinks(json: &str) -> Result<Vec<RawSink>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    parse(json)
}

pub fn parse_sink_infos(json: &str) -> Result<Vec<SinkInfo>> {
    Ok(sinks(json)?
        .into_iter()
        .map(|s| SinkInfo {
            index: s.index,
            volume: s
                .volume
                .values()
                .next()
                .and_then(|v| parse_percent(&v.value_percent))
                .unwrap_or(0),
            name: s.name,
            owner_module: s.owner_module,
            muted: s.mute,
        })
        .collect())
}

pub fn parse_sink_descriptors(json: &str) -> Result<Vec<SinkDescriptor>> {
    Ok(sinks(json)?
        .into_iter()
        .map(|s| SinkDescriptor {
            id: s.name.clone(),
            description: if s.description.is_empty() {
                s.name.clone()
            } else {
                s.description
            },
            name: s.name,
        })
        .collect())
}

pub fn parse_sink_inputs(json: &str) -> Result<Vec<StreamInfo>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let inputs: Vec<RawSinkInput> = parse(json)?;
    Ok(inputs
        .into_iter()
        .map(|i| StreamInfo {
            id: i.index,
            app_name: i.property("application.name"),
            process_name: i.property("application.process.binary"),
            media_name: i.property("media.name"),
            sink: i.sink,
            owner_module: i.owner_module,
        })
        .collect())
}

/// `load-module` prints the new module's index
pub fn parse_module_index(stdout: &str) -> Result<u32> {
    stdout
        .trim()
        .parse()
        .map_err(|_| BackendError::Parse(format!("expected a module index, got {:?}", stdout.trim())))
}
