//! The `pactl subscribe` notification feed

use duet_core::domain::backend::{BackendError, BackendEvent, EventFeed, EventKind, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Parse one feed line such as `Event 'new' on sink-input #123`
///
/// Only playback stream events are kept; anything else yields `None`.
pub fn parse_event_line(line: &str) -> Option<BackendEvent> {
    let rest = line.trim().strip_prefix("Event '")?;
    let (kind, rest) = rest.split_once('\'')?;
    let kind = match kind {
        "new" => EventKind::New,
        "remove" => EventKind::Remove,
        "change" => EventKind::Change,
        _ => return None,
    };
    let id = rest.trim().strip_prefix("on sink-input #")?;
    let stream = id.trim().parse().ok()?;
    Some(BackendEvent::new(kind, stream))
}

/// Start `pactl subscribe` and forward stream events until either side goes away
///
/// Must be called from within a tokio runtime. The child is killed as soon as
/// the receiving end is dropped.
pub fn spawn_feed(program: &str) -> Result<EventFeed> {
    let mut command = Command::new(program);
    command.arg("subscribe");
    feed_from(command)
}

fn feed_from(mut command: Command) -> Result<EventFeed> {
    let runtime = Handle::try_current()
        .map_err(|e| BackendError::Unavailable(format!("no async runtime for the event feed: {}", e)))?;

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BackendError::Unavailable("subscribe output not captured".to_string()))?;
    let (tx, rx) = mpsc::unbounded_channel();

    runtime.spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let Some(event) = parse_event_line(&line) else {
                            continue;
                        };
                        debug!(?event, "Backend event");
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("Subscription feed ended");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Subscription feed failed");
                        break;
                    }
                },
                _ = tx.closed() => {
                    debug!("Subscription feed no longer listened to");
                    break;
                }
            }
        }
        if let Err(e) = child.kill().await {
            debug!(error = %e, "Subscription process already gone");
        }
    });

    info!("Subscribed to stream events");
    Ok(rx)
}
