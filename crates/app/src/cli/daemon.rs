//! The daemon run loop

use crate::instance::InstanceLock;
use duet_core::domain::{
    AudioBackend, ConfigManager, DaemonConfig, DuetConfig, Engine, EngineHandle, EngineOptions,
    StreamMonitor,
};
use duet_infra::PactlBackend;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Write the current engine state, unless the engine has no channels
pub async fn save_state(engine: &EngineHandle, manager: &ConfigManager, daemon: &DaemonConfig) {
    let state = match engine
        .run(|e| (!e.list_channels().is_empty()).then(|| e.state()))
        .await
    {
        Ok(Some(state)) => state,
        Ok(None) => {
            debug!("No channels, skipping save");
            return;
        }
        Err(e) => {
            error!(error = %e, "Failed to snapshot engine state");
            return;
        }
    };

    let config = DuetConfig {
        daemon: daemon.clone(),
        mixer: state,
    };
    if let Err(e) = manager.save(&config).await {
        error!(error = %e, "Failed to save configuration");
    }
}

/// Save once persistent changes have been quiet for the debounce period
pub async fn autosave(
    engine: EngineHandle,
    manager: Arc<ConfigManager>,
    daemon: DaemonConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut events = engine.subscribe();
    let debounce = daemon.autosave_debounce();
    let mut deadline: Option<Instant> = None;

    loop {
        let due = deadline;
        let wait = async move {
            match due {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.is_persistent() => {
                    deadline = Some(Instant::now() + debounce);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Auto-save fell behind on engine events");
                    deadline = Some(Instant::now() + debounce);
                }
                Err(RecvError::Closed) => break,
            },
            _ = wait => {
                deadline = None;
                save_state(&engine, &manager, &daemon).await;
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("Auto-save stopped");
}

/// Run the daemon until interrupted
pub async fn run(manager: ConfigManager) -> anyhow::Result<()> {
    let _lock = InstanceLock::acquire(&InstanceLock::lock_dir(manager.config_dir()))?;

    let config = manager.load().await;
    let backend: Arc<dyn AudioBackend> =
        Arc::new(PactlBackend::new(config.daemon.command_timeout()));

    serve(backend, manager, config, wait_for_signal()).await
}

/// Bring the engine up on `backend`, keep it running until `stop` resolves,
/// then save and release every module the engine created
///
/// Once the engine has touched the server, every exit path goes through
/// [`Engine::shutdown`](duet_core::domain::Engine::shutdown).
pub async fn serve<S>(
    backend: Arc<dyn AudioBackend>,
    manager: ConfigManager,
    config: DuetConfig,
    stop: S,
) -> anyhow::Result<()>
where
    S: Future<Output = std::io::Result<()>>,
{
    let daemon = config.daemon.clone();

    // Opened first so streams appearing while the mixes are built still get routed
    let feed = backend.subscribe()?;
    let engine = EngineHandle::new(Engine::new(Arc::clone(&backend), EngineOptions::from(&daemon)));

    let state = config.mixer;
    let started = engine
        .run(move |e| {
            e.initialize()?;
            e.apply_state(&state)
        })
        .await
        .and_then(|result| result);
    if let Err(e) = started {
        error!(error = %e, "Engine failed to start");
        release(&engine).await;
        return Err(e.into());
    }

    let manager = Arc::new(manager);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = StreamMonitor::new(engine.clone(), daemon.settle_timing().stream_settle)
        .spawn(feed, shutdown_rx.clone());
    let saver = tokio::spawn(autosave(
        engine.clone(),
        Arc::clone(&manager),
        daemon.clone(),
        shutdown_rx,
    ));

    info!("duetd running");
    let stopped = stop.await;
    match &stopped {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => error!(error = %e, "Failed to wait for a shutdown signal"),
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = monitor.await {
        warn!(error = %e, "Stream monitor task failed");
    }
    if let Err(e) = saver.await {
        warn!(error = %e, "Auto-save task failed");
    }

    save_state(&engine, &manager, &daemon).await;
    release(&engine).await;

    info!("duetd stopped");
    stopped.map_err(Into::into)
}

async fn release(engine: &EngineHandle) {
    if let Err(e) = engine.run(|e| e.shutdown()).await {
        error!(error = %e, "Failed to release audio server modules");
    }
}

async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

/// Print the devices a mix can play into
pub async fn list_devices(manager: ConfigManager) -> anyhow::Result<()> {
    let daemon = manager.load().await.daemon;
    let backend: Arc<dyn AudioBackend> = Arc::new(PactlBackend::new(daemon.command_timeout()));
    let engine = EngineHandle::new(Engine::new(backend, EngineOptions::from(&daemon)));

    let devices = engine.run(|e| e.list_output_devices()).await??;
    if devices.is_empty() {
        println!("No output devices found");
    }
    for device in devices {
        println!("{}\t{}", device.id, device.description);
    }
    Ok(())
}
