//! Writer lock for the command channel's request pipe.
//!
//! Only one client at a time may write a request record. The lock is a file
//! created with `O_EXCL` next to the pipe, holding the owner's pid and
//! creation time:
//!
//! ```text
//! request.lock   # {"pid":4242,"created":"2026-10-19T12:00:00Z"}
//! ```
//!
//! A client that finds the lock taken reclaims it when the owner pid no
//! longer exists, or when the lock is older than the stale threshold (the
//! write it guards takes milliseconds, so an old lock means a wedged or
//! recycled owner). Unreadable locks fall back to the file's mtime.

use chrono::{DateTime, Utc};
use fs_err as fs;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for {path} (holder pid {holder:?}); retry")]
    Timeout {
        path: PathBuf,
        waited: Duration,
        holder: Option<u32>,
    },

    #[error("failed to create lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    /// Timeouts are worth retrying; IO failures usually are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub created: String,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            created: Utc::now().to_rfc3339(),
        }
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Held writer lock; released on drop.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
    owner: LockOwner,
    released: bool,
}

impl WriterLock {
    pub fn acquire(path: &Path, options: LockOptions) -> Result<Self, LockError> {
        let started = Instant::now();
        let deadline = started + options.timeout;
        let owner = LockOwner::current();

        loop {
            match try_create(path, &owner) {
                Ok(()) => {
                    debug!(path = %path.display(), "Acquired command channel lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        owner,
                        released: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }

            let observed = read_owner(path);
            if let Some(reason) = stale_reason(path, observed.as_ref(), options.stale_after) {
                if reclaim(path, observed.as_ref()) {
                    warn!(
                        path = %path.display(),
                        holder = ?observed.as_ref().map(|owner| owner.pid),
                        reason,
                        "Reclaimed stale command channel lock"
                    );
                    continue;
                }
            }

            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: started.elapsed(),
                    holder: observed.map(|owner| owner.pid),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // A slow holder may have been reclaimed; never delete the next owner's lock.
        if read_owner(&self.path).as_ref() != Some(&self.owner) {
            warn!(path = %self.path.display(), "Command channel lock was reclaimed while held");
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(error = %err, "Failed to release command channel lock");
            }
        }
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let result = unsafe { libc::kill(pid as i32, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn try_create(path: &Path, owner: &LockOwner) -> io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o660)
        .open(path)?;
    let payload = serde_json::to_vec(owner).map_err(io::Error::other)?;
    file.write_all(&payload)?;
    file.flush()
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn stale_reason(
    path: &Path,
    owner: Option<&LockOwner>,
    stale_after: Duration,
) -> Option<&'static str> {
    match owner {
        Some(owner) => {
            if !is_pid_alive(owner.pid) {
                return Some("owner process exited");
            }
            let age = owner
                .created_at()
                .and_then(|created| Utc::now().signed_duration_since(created).to_std().ok())
                .unwrap_or_default();
            (age > stale_after).then_some("lock older than stale threshold")
        }
        None => {
            let age = std::fs::metadata(path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())?;
            (age > stale_after).then_some("unreadable lock older than stale threshold")
        }
    }
}

/// Removes the lock only if it still belongs to the owner judged stale.
///
/// The lock is first renamed aside, so only one reclaimer can win it, and the
/// moved file is checked again before it is unlinked. A lock that turns out
/// to be fresh is linked back unless a new one has already taken its place.
fn reclaim(path: &Path, observed: Option<&LockOwner>) -> bool {
    let aside = aside_path(path);
    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return true,
        Err(err) => {
            warn!(error = %err, path = %path.display(), "Failed to move stale lock aside");
            return false;
        }
    }

    let stale = read_owner(&aside).as_ref() == observed;
    if !stale {
        match std::fs::hard_link(&aside, path) {
            Ok(()) => debug!(path = %path.display(), "Restored lock taken over before reclaim"),
            Err(err) => warn!(error = %err, path = %path.display(), "Failed to restore fresh lock"),
        }
    }
    if let Err(err) = std::fs::remove_file(&aside) {
        warn!(error = %err, path = %aside.display(), "Failed to remove reclaimed lock");
    }
    stale
}

fn aside_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(
        ".stale.{}.{:08x}",
        std::process::id(),
        rand::thread_rng().next_u32()
    ));
    path.with_file_name(name)
}
