//! Stream monitor: drives the router from the backend's notification feed
//!
//! Events are handled one at a time in arrival order. A new stream is only
//! looked at after a settle delay, because the server may attach its metadata
//! late; by then the stream may already be gone, which the engine treats as a
//! no-op.

use crate::domain::backend::{BackendEvent, EventFeed, EventKind, StreamId};
use crate::domain::engine::EngineHandle;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct StreamMonitor {
    engine: EngineHandle,
    settle: Duration,
}

impl StreamMonitor {
    pub fn new(engine: EngineHandle, settle: Duration) -> Self {
        Self { engine, settle }
    }

    /// Run on the current runtime until the feed closes or `shutdown` fires
    pub fn spawn(self, feed: EventFeed, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(feed, shutdown))
    }

    pub async fn run(self, mut feed: EventFeed, mut shutdown: watch::Receiver<bool>) {
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<StreamId>();
        info!(settle_ms = self.settle.as_millis() as u64, "Stream monitor started");

        loop {
            tokio::select! {
                event = feed.recv() => match event {
                    Some(event) => self.dispatch(event, &settled_tx).await,
                    None => {
                        warn!("Backend event feed closed");
                        break;
                    }
                },
                Some(stream) = settled_rx.recv() => self.settled(stream).await,
                _ = shutdown.changed() => break,
            }
        }

        info!("Stream monitor stopped");
    }

    async fn dispatch(&self, event: BackendEvent, settled_tx: &mpsc::UnboundedSender<StreamId>) {
        let stream = event.stream;
        match event.kind {
            EventKind::New => {
                debug!(stream, "New stream, waiting for it to settle");
                let tx = settled_tx.clone();
                let settle = self.settle;
                tokio::spawn(async move {
                    tokio::time::sleep(settle).await;
                    // The monitor may have stopped meanwhile
                    let _ = tx.send(stream);
                });
            }
            EventKind::Remove => {
                debug!(stream, "Stream removed");
                if let Err(e) = self.engine.run(move |e| e.handle_stream_removed(stream)).await {
                    error!(stream, error = %e, "Failed to handle removed stream");
                }
            }
            EventKind::Change => {
                if let Err(e) = self.engine.run(|e| e.handle_streams_changed()).await {
                    error!(stream, error = %e, "Failed to handle changed stream");
                }
            }
        }
    }

    async fn settled(&self, stream: StreamId) {
        match self.engine.run(move |e| e.handle_stream_settled(stream)).await {
            Ok(Ok(Some(outcome))) => debug!(stream, ?outcome, "New stream routed"),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(stream, error = %e, "Failed to route new stream"),
            Err(e) => error!(stream, error = %e, "Failed to handle new stream"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::AudioBackend;
    use crate::domain::channel::{ChannelId, Mix};
    use crate::domain::engine::{Engine, EngineOptions};
    use crate::domain::event::EngineEvent;
    use crate::domain::loopback::SettleTiming;
    use crate::testing::FakeBackend;
    use std::sync::Arc;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    struct Fixture {
        backend: Arc<FakeBackend>,
        handle: EngineHandle,
        events: broadcast::Receiver<EngineEvent>,
        _shutdown: watch::Sender<bool>,
    }

    fn start(settle: Duration) -> Fixture {
        let backend = Arc::new(FakeBackend::new());
        backend.add_output_device("alsa_output.speakers");
        let options = EngineOptions {
            timing: SettleTiming::immediate(),
            ..EngineOptions::default()
        };
        let mut engine = Engine::new(backend.clone(), options);
        engine.initialize().unwrap();
        engine.add_routing_rule("discord", ChannelId::new("chat"));
        let events = engine.subscribe();

        let handle = EngineHandle::new(engine);
        let feed = backend.subscribe().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        StreamMonitor::new(handle.clone(), settle).spawn(feed, shutdown_rx);

        Fixture {
            backend,
            handle,
            events,
            _shutdown: shutdown_tx,
        }
    }

    async fn next_event(events: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no engine event")
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_stream_is_routed_after_settling() {
        let mut fx = start(Duration::from_millis(20));
        let id = fx.backend.add_stream("WEBRTC VoiceEngine", "discord", "");

        fx.backend.emit(EventKind::New, id);

        let event = next_event(&mut fx.events).await;
        assert!(matches!(event, EngineEvent::StreamAdded { id: added, .. } if added == id));
        assert_eq!(fx.handle.lock().stream_channel(id), Some(ChannelId::new("chat")));
    }

    #[tokio::test]
    async fn test_stream_gone_before_settling_is_ignored() {
        let mut fx = start(Duration::from_millis(200));
        let id = fx.backend.add_stream("Discord", "discord", "");

        fx.backend.emit(EventKind::New, id);
        fx.backend.remove_stream(id);
        fx.backend.emit(EventKind::Remove, id);

        assert_eq!(next_event(&mut fx.events).await, EngineEvent::StreamRemoved(id));
        assert_eq!(next_event(&mut fx.events).await, EngineEvent::StreamsChanged);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(fx.events.try_recv().is_err());
        assert_eq!(fx.handle.lock().stream_channel(id), None);
    }

    #[tokio::test]
    async fn test_own_loopback_is_never_routed() {
        let mut fx = start(Duration::from_millis(10));
        {
            let mut engine = fx.handle.lock();
            engine
                .set_output_device(Mix::Personal, Some("alsa_output.speakers".to_string()))
                .unwrap();
        }
        let _ = timeout(Duration::from_millis(100), async {
            while fx.events.recv().await.is_ok() {}
        })
        .await;
        let edge = fx
            .handle
            .lock()
            .loopbacks()
            .edge(Mix::Personal, &ChannelId::new("game"))
            .unwrap();

        fx.backend.emit(EventKind::New, edge.input);
        fx.backend.emit(EventKind::Change, edge.input);

        assert_eq!(next_event(&mut fx.events).await, EngineEvent::StreamsChanged);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.events.try_recv().is_err());
        assert_eq!(fx.handle.lock().stream_channel(edge.input), None);
    }
}
