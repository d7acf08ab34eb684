//! Single-instance guard

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const LOCK_FILE: &str = "duetd.lock";

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("Another duetd instance is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("Lock file error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, InstanceError>;

/// Exclusive lock file holding the daemon's pid, removed on drop
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Runtime directory, or the config directory when there is none
    pub fn lock_dir(config_dir: &Path) -> PathBuf {
        dirs::runtime_dir().unwrap_or_else(|| config_dir.to_path_buf())
    }

    /// Take the lock, replacing it if its owner is dead
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    info!(path = %path.display(), "Instance lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match read_pid(&path) {
                    Some(pid) if is_alive(pid) => return Err(InstanceError::AlreadyRunning(pid)),
                    _ => {
                        warn!(path = %path.display(), "Replacing stale instance lock");
                        match fs::remove_file(&path) {
                            Ok(()) => {}
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(InstanceError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "lock file keeps reappearing",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Instance lock released"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove instance lock"),
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
