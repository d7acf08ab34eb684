//! Running `pactl` with a time budget

use duet_core::domain::backend::{BackendError, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run a command, returning its stdout
///
/// The process is killed if it runs past `timeout`. A non-zero exit becomes
/// [`BackendError::CommandFailed`], or [`BackendError::NotFound`] when the
/// server reports that the object does not exist.
pub fn run(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    let command_line = format!("{} {}", program, args.join(" "));
    debug!(command = %command_line, "Running command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match wait_until(&mut child, Instant::now() + timeout)? {
        Some(status) => status,
        None => {
            warn!(command = %command_line, timeout_ms = timeout.as_millis() as u64, "Command timed out");
            let _ = child.kill();
            let _ = child.wait();
            return Err(BackendError::Timeout(command_line));
        }
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    if status.success() {
        return Ok(stdout);
    }

    let reason = stderr.trim().to_string();
    if reason.contains("No such entity") {
        return Err(BackendError::NotFound(command_line));
    }
    let reason = if reason.is_empty() {
        status.to_string()
    } else {
        reason
    };
    Err(BackendError::failed(command_line, reason))
}
