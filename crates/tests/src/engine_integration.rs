//! Integration tests for the routing and mix engine
//!
//! These tests drive the whole engine against the in-memory backend: channel
//! setup, rule-based routing, the two mixes and the notification feed.

use duet_core::domain::{
    AudioBackend, ChannelId, Engine, EngineEvent, EngineHandle, EngineOptions, EventKind, Mix,
    SettleTiming, StreamMonitor, UNASSIGNED_SINK,
};
use duet_core::testing::FakeBackend;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const SPEAKERS: &str = "alsa_output.pci-0000_00_1f.3.analog-stereo";
const CHANNELS: [&str; 4] = ["game", "chat", "media", "aux"];

fn create_engine() -> (Arc<FakeBackend>, Engine) {
    let backend = Arc::new(FakeBackend::new());
    backend.add_output_device(SPEAKERS);
    let options = EngineOptions {
        timing: SettleTiming::immediate(),
        ..EngineOptions::default()
    };
    let mut engine = Engine::new(backend.clone(), options);
    engine.initialize().unwrap();
    (backend, engine)
}

fn id(name: &str) -> ChannelId {
    ChannelId::new(name)
}

fn route_new_stream(backend: &FakeBackend, engine: &mut Engine, app: &str, process: &str) -> u32 {
    let stream = backend.add_stream(app, process, "playback");
    engine.handle_stream_settled(stream).unwrap();
    stream
}

// ============================================================================
// CHANNELS
// ============================================================================

#[test]
fn test_initialize_creates_the_four_channels() {
    let (_backend, engine) = create_engine();

    let channels = engine.list_channels();

    assert_eq!(channels.len(), 4);
    for (channel, expected) in channels.iter().zip(CHANNELS) {
        assert_eq!(channel.id.as_str(), expected);
        assert_eq!(channel.personal_volume, 100);
        assert_eq!(channel.stream_volume, 0);
    }
}

#[test]
fn test_unknown_channel_is_rejected_everywhere() {
    let (backend, mut engine) = create_engine();
    let before = engine.list_channels();
    let calls = backend.call_count();
    let bogus = id("invalid");

    assert!(engine.set_channel_volume(&bogus, 50).is_err());
    assert!(engine.set_channel_mute(&bogus, true).is_err());
    assert!(engine.set_personal_mix_level(&bogus, 50).is_err());
    assert!(engine.set_stream_mix_level(&bogus, 50).is_err());
    assert!(engine.set_personal_mute(&bogus, true).is_err());
    assert!(engine.set_stream_mute(&bogus, true).is_err());

    assert_eq!(engine.list_channels(), before);
    assert_eq!(backend.call_count(), calls);
}

#[test]
fn test_setters_clamp() {
    let (_backend, mut engine) = create_engine();

    assert_eq!(engine.set_channel_volume(&id("game"), 150).unwrap(), 100);
    assert_eq!(engine.set_channel_volume(&id("game"), -50).unwrap(), 0);
    assert_eq!(engine.set_stream_mix_level(&id("chat"), 150).unwrap(), 100);
    assert_eq!(engine.set_stream_mix_level(&id("chat"), -50).unwrap(), 0);
    assert_eq!(engine.set_personal_mix_level(&id("media"), 50).unwrap(), 50);
}

// ============================================================================
// ROUTING
// ============================================================================

#[test]
fn test_rule_routes_new_stream() {
    let (backend, mut engine) = create_engine();
    engine.add_routing_rule("discord", id("chat"));

    let stream = route_new_stream(&backend, &mut engine, "WEBRTC VoiceEngine", "discord");

    assert_eq!(engine.stream_channel(stream), Some(id("chat")));
    assert_eq!(backend.stream_sink_name(stream).as_deref(), Some("duet_chat"));
}

#[test]
fn test_unmatched_stream_goes_to_silent_sink() {
    let (backend, mut engine) = create_engine();

    let stream = route_new_stream(&backend, &mut engine, "RandomApp", "randomapp");

    assert_eq!(engine.stream_channel(stream), None);
    assert_eq!(backend.stream_sink_name(stream).as_deref(), Some(UNASSIGNED_SINK));
    assert!(backend.sink_info(UNASSIGNED_SINK).unwrap().unwrap().muted);
}

#[test]
fn test_duplicate_rule_replaces_target() {
    let (backend, mut engine) = create_engine();
    engine.add_routing_rule("spotify", id("game"));
    engine.add_routing_rule("spotify", id("media"));

    assert_eq!(engine.routing_rules().len(), 1);
    let stream = route_new_stream(&backend, &mut engine, "Spotify", "spotify");
    assert_eq!(engine.stream_channel(stream), Some(id("media")));
}

#[test]
fn test_removing_missing_rule_is_noop() {
    let (_backend, mut engine) = create_engine();
    engine.add_routing_rule("discord", id("chat"));

    assert!(!engine.remove_routing_rule("teamspeak"));
    assert_eq!(engine.routing_rules().len(), 1);
}

#[test]
fn test_manual_move_teaches_future_instances() {
    let (backend, mut engine) = create_engine();
    let first = route_new_stream(&backend, &mut engine, "Steam", "steam");
    assert_eq!(engine.stream_channel(first), None);

    engine.move_stream_to_channel(first, &id("game")).unwrap();
    let second = route_new_stream(&backend, &mut engine, "Steam", "steam");

    assert_eq!(engine.stream_channel(second), Some(id("game")));
}

#[test]
fn test_removed_stream_forgets_assignment() {
    let (backend, mut engine) = create_engine();
    engine.add_routing_rule("discord", id("chat"));
    let stream = route_new_stream(&backend, &mut engine, "Discord", "discord");

    backend.remove_stream(stream);
    engine.handle_stream_removed(stream);

    assert_eq!(engine.stream_channel(stream), None);
    assert!(engine.list_streams().unwrap().is_empty());
}

#[test]
fn test_restart_keeps_streams_already_on_channels() {
    let (backend, mut engine) = create_engine();
    engine.add_routing_rule("vlc", id("media"));
    let stream = route_new_stream(&backend, &mut engine, "VLC", "vlc");
    let mut saved = engine.state();
    saved.rules.clear();

    let options = EngineOptions {
        timing: SettleTiming::immediate(),
        ..EngineOptions::default()
    };
    let mut restarted = Engine::new(backend.clone(), options);
    restarted.initialize().unwrap();
    restarted.apply_state(&saved).unwrap();

    assert_eq!(restarted.stream_channel(stream), Some(id("media")));
}

// ============================================================================
// MIXES
// ============================================================================

#[test]
fn test_selecting_device_builds_four_audible_edges() {
    let (backend, mut engine) = create_engine();
    engine.set_master_volume(80);

    engine
        .set_output_device(Mix::Personal, Some(SPEAKERS.to_string()))
        .unwrap();

    assert_eq!(engine.loopbacks().edge_count(Mix::Personal), 4);
    for channel in engine.list_channels() {
        let edge = engine.loopbacks().edge(Mix::Personal, &channel.id).unwrap();
        let input = backend.input(edge.input).unwrap();
        assert_eq!(u32::from(input.volume), u32::from(channel.personal_volume) * 80 / 100);
        assert!(!input.muted);
    }
}

#[test]
fn test_master_halves_edges_without_recreating_them() {
    let (backend, mut engine) = create_engine();
    engine
        .set_output_device(Mix::Personal, Some(SPEAKERS.to_string()))
        .unwrap();
    engine.set_personal_mix_level(&id("chat"), 75).unwrap();
    let before: Vec<_> = engine
        .loopbacks()
        .edges(Mix::Personal)
        .map(|(id, edge)| (id.clone(), *edge))
        .collect();

    engine.set_master_volume(50);

    let after: Vec<_> = engine
        .loopbacks()
        .edges(Mix::Personal)
        .map(|(id, edge)| (id.clone(), *edge))
        .collect();
    assert_eq!(before, after);
    let chat = engine.loopbacks().edge(Mix::Personal, &id("chat")).unwrap();
    assert_eq!(backend.input(chat.input).unwrap().volume, 37);
    let game = engine.loopbacks().edge(Mix::Personal, &id("game")).unwrap();
    assert_eq!(backend.input(game.input).unwrap().volume, 50);
}

#[test]
fn test_mixes_are_independent() {
    let (backend, mut engine) = create_engine();
    backend.add_output_device("alsa_output.usb-stream");
    engine
        .set_output_device(Mix::Personal, Some(SPEAKERS.to_string()))
        .unwrap();
    engine
        .set_output_device(Mix::Stream, Some("alsa_output.usb-stream".to_string()))
        .unwrap();
    engine.set_mix_enabled(Mix::Stream, true).unwrap();

    engine.set_stream_mix_level(&id("game"), 30).unwrap();
    engine.set_stream_mute(&id("chat"), true).unwrap();

    let personal_game = engine.loopbacks().edge(Mix::Personal, &id("game")).unwrap();
    let stream_game = engine.loopbacks().edge(Mix::Stream, &id("game")).unwrap();
    let personal_chat = engine.loopbacks().edge(Mix::Personal, &id("chat")).unwrap();
    let stream_chat = engine.loopbacks().edge(Mix::Stream, &id("chat")).unwrap();
    assert_eq!(backend.input(personal_game.input).unwrap().volume, 100);
    assert_eq!(backend.input(stream_game.input).unwrap().volume, 30);
    assert!(!backend.input(personal_chat.input).unwrap().muted);
    assert!(backend.input(stream_chat.input).unwrap().muted);
}

#[test]
fn test_edges_are_never_listed_as_streams() {
    let (backend, mut engine) = create_engine();
    engine
        .set_output_device(Mix::Personal, Some(SPEAKERS.to_string()))
        .unwrap();
    let visible = backend.add_stream("Firefox", "firefox", "Video");
    let edge_inputs: HashSet<_> = engine
        .loopbacks()
        .edges(Mix::Personal)
        .map(|(_, edge)| edge.input)
        .collect();

    let streams = engine.list_streams().unwrap();

    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].id, visible);
    for input in &edge_inputs {
        assert_eq!(engine.handle_stream_settled(*input).unwrap(), None);
        assert_eq!(engine.stream_channel(*input), None);
    }
}

#[test]
fn test_changing_device_moves_every_edge() {
    let (backend, mut engine) = create_engine();
    backend.add_output_device("alsa_output.usb-headset");
    engine
        .set_output_device(Mix::Personal, Some(SPEAKERS.to_string()))
        .unwrap();

    engine
        .set_output_device(Mix::Personal, Some("alsa_output.usb-headset".to_string()))
        .unwrap();

    assert_eq!(backend.loopback_count(), 4);
    assert!(!backend.sink_info(SPEAKERS).unwrap().unwrap().muted);
    assert!(!backend.sink_info("alsa_output.usb-headset").unwrap().unwrap().muted);

    engine.set_output_device(Mix::Personal, None).unwrap();
    assert_eq!(backend.loopback_count(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_rebuild_leaves_one_audible_edge_per_channel(
        levels in proptest::collection::vec(1i32..=100, 4),
        master in 1i32..=100,
        rebuilds in 1usize..3,
    ) {
        let (backend, mut engine) = create_engine();
        for (name, level) in CHANNELS.iter().zip(&levels) {
            engine.set_personal_mix_level(&id(name), *level).unwrap();
        }
        engine.set_master_volume(master);

        for _ in 0..rebuilds {
            engine.set_mix_enabled(Mix::Personal, false).unwrap();
            engine.set_output_device(Mix::Personal, Some(SPEAKERS.to_string())).unwrap();
            engine.set_mix_enabled(Mix::Personal, true).unwrap();
        }

        prop_assert_eq!(engine.loopbacks().edge_count(Mix::Personal), 4);
        prop_assert_eq!(backend.loopback_count(), 4);
        for (name, level) in CHANNELS.iter().zip(&levels) {
            let edge = engine.loopbacks().edge(Mix::Personal, &id(name)).unwrap();
            let input = backend.input(edge.input).unwrap();
            prop_assert_eq!(input.volume as i32, level * master / 100);
            prop_assert!(!input.muted);
        }
    }
}

// ============================================================================
// MONITOR
// ============================================================================

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
    wanted: impl Fn(&EngineEvent) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                break;
            }
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_monitor_routes_and_forgets() {
    let (backend, mut engine) = create_engine();
    engine.add_routing_rule("discord", id("chat"));
    let mut events = engine.subscribe();
    let handle = EngineHandle::new(engine);
    let (_shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
    StreamMonitor::new(handle.clone(), Duration::from_millis(10))
        .spawn(backend.subscribe().unwrap(), shutdown_rx);

    let stream = backend.add_stream("Discord", "discord", "");
    backend.emit(EventKind::New, stream);
    next_event(&mut events, |e| matches!(e, EngineEvent::StreamAdded { id, .. } if *id == stream)).await;
    assert_eq!(handle.lock().stream_channel(stream), Some(id("chat")));

    backend.remove_stream(stream);
    backend.emit(EventKind::Remove, stream);
    next_event(&mut events, |e| *e == EngineEvent::StreamRemoved(stream)).await;
    assert_eq!(handle.lock().stream_channel(stream), None);
}
