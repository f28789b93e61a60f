//! Single-instance guard.
//!
//! Only one daemon may own the bus. `cecd.pid` in the runtime directory is
//! created exclusively; a leftover file whose process is gone is cleaned up.

use fs_err as fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use cecd_protocol::lock::is_pid_alive;

use crate::error::InstanceError;

pub const PID_FILE_NAME: &str = "cecd.pid";

#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
    pid: u32,
}

impl InstanceGuard {
    pub fn acquire(dir: &Path) -> Result<Self, InstanceError> {
        let path = dir.join(PID_FILE_NAME);
        let pid = std::process::id();
        fs::create_dir_all(dir).map_err(|source| InstanceError::PidFile {
            path: path.clone(),
            source,
        })?;

        match create_pid_file(&path, pid) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                match read_pid(&path) {
                    Some(existing) if existing != pid && is_pid_alive(existing) => {
                        info!(pid = existing, "Refusing to start: existing daemon alive");
                        return Err(InstanceError::AlreadyRunning { pid: existing });
                    }
                    existing => {
                        warn!(pid = ?existing, "Removing stale pid file");
                    }
                }
                remove_if_present(&path)?;
                create_pid_file(&path, pid).map_err(|source| InstanceError::PidFile {
                    path: path.clone(),
                    source,
                })?;
            }
            Err(source) => return Err(InstanceError::PidFile { path, source }),
        }

        info!(pid, file = %path.display(), "Pid file written");
        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        // Leave the file alone if another instance has since taken it over.
        if read_pid(&self.path) != Some(self.pid) {
            return;
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(error = %err, "Failed to remove pid file");
            }
        }
    }
}

fn create_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)?;
    writeln!(file, "{pid}")?;
    file.sync_all()
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn remove_if_present(path: &Path) -> Result<(), InstanceError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(InstanceError::PidFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    #[test]
    fn writes_and_removes_pid_file() {
        let dir = TempDir::new().unwrap();
        let guard = InstanceGuard::acquire(dir.path()).unwrap();
        assert_eq!(read_pid(guard.path()), Some(std::process::id()));

        let path = guard.path().to_path_buf();
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn live_owner_blocks_second_instance() {
        let dir = TempDir::new().unwrap();
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        std::fs::write(dir.path().join(PID_FILE_NAME), format!("{}\n", child.id())).unwrap();

        let result = InstanceGuard::acquire(dir.path());
        let _ = child.kill();
        let _ = child.wait();

        match result {
            Err(InstanceError::AlreadyRunning { pid }) => assert_eq!(pid, child.id()),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn stale_pid_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let mut child = Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        std::fs::write(dir.path().join(PID_FILE_NAME), format!("{dead_pid}\n")).unwrap();

        let guard = InstanceGuard::acquire(dir.path()).unwrap();
        assert_eq!(read_pid(guard.path()), Some(std::process::id()));
    }

    #[test]
    fn garbage_pid_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(PID_FILE_NAME), "not a pid").unwrap();
        assert!(InstanceGuard::acquire(dir.path()).is_ok());
    }
}
