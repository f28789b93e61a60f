//! Daemon side of the command channel.
//!
//! The request FIFO is opened read/write so the daemon itself keeps a writer
//! attached: the reader never sees EOF between clients and just blocks.
//! Replies are renamed into `replies/` so clients never observe a partial
//! file.

use fs_err as fs;
use std::ffi::CString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use cecd_protocol::{parse_request_line, ChannelPaths, Command, Reply, MAX_REQUEST_BYTES};

use crate::error::ChannelError;

pub struct ChannelServer {
    paths: ChannelPaths,
    pipe: std::fs::File,
}

impl ChannelServer {
    /// Creates the channel directory, a fresh FIFO and the replies directory.
    pub fn open(paths: ChannelPaths, pipe_mode: u32) -> Result<Self, ChannelError> {
        let prepare = |path: &Path| {
            fs::create_dir_all(path).map_err(|source| ChannelError::Prepare {
                path: path.to_path_buf(),
                source,
            })
        };
        prepare(paths.dir())?;
        prepare(&paths.replies_dir())?;

        let pipe_path = paths.request_pipe();
        create_fifo(&pipe_path, pipe_mode)?;

        let pipe = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&pipe_path)
            .map_err(|source| ChannelError::CreatePipe {
                path: pipe_path.clone(),
                source,
            })?;

        info!(path = %pipe_path.display(), "Command channel open");
        Ok(Self { paths, pipe })
    }

    #[cfg(test)]
    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    pub fn replies(&self) -> ReplyWriter {
        ReplyWriter::new(self.paths.replies_dir())
    }

    pub fn waker(&self) -> ChannelWaker {
        ChannelWaker {
            pipe: self.paths.request_pipe(),
        }
    }

    /// Reads requests until `stop` is raised or `deliver` reports that the
    /// dispatcher is gone. Invalid requests are answered here.
    pub fn spawn_reader<F>(self, stop: Arc<AtomicBool>, mut deliver: F) -> io::Result<JoinHandle<()>>
    where
        F: FnMut(Command) -> bool + Send + 'static,
    {
        let replies = self.replies();
        thread::Builder::new()
            .name("cecd-channel".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(&self.pipe);
                let mut buf = Vec::with_capacity(MAX_REQUEST_BYTES);
                loop {
                    buf.clear();
                    match read_record(&mut reader, &mut buf) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            warn!(error = %err, "Command channel read failed");
                            break;
                        }
                    }
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }

                    let line = String::from_utf8_lossy(&buf);
                    match parse_request_line(&line) {
                        Ok(command) => {
                            debug!(request_id = %command.request_id, kind = %command.kind, "Request received");
                            if !deliver(command) {
                                break;
                            }
                        }
                        Err(rejected) => match rejected.request_id {
                            Some(request_id) => {
                                warn!(%request_id, error = %rejected.error, "Rejected request");
                                if let Err(err) =
                                    replies.write(&request_id, &Reply::error(rejected.error.to_string()))
                                {
                                    warn!(error = %err, "Failed to write rejection");
                                }
                            }
                            None if line.trim().is_empty() => {}
                            None => warn!(error = %rejected.error, "Dropped unaddressable request"),
                        },
                    }
                }
                debug!("Command channel reader stopped");
                self.remove_pipe();
            })
    }

    fn remove_pipe(&self) {
        let path = self.paths.request_pipe();
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(error = %err, "Failed to remove request pipe");
            }
        }
    }
}

/// Reads one newline-terminated record, keeping at most twice the request
/// limit. The tail of an overlong line is discarded up to its newline.
fn read_record<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize> {
    let cap = (MAX_REQUEST_BYTES * 2) as u64;
    let read = reader.by_ref().take(cap).read_until(b'\n', buf)?;
    if read as u64 == cap && buf.last() != Some(&b'\n') {
        let skipped = skip_line(reader)?;
        warn!(kept = read, skipped, "Discarded tail of overlong request");
    }
    Ok(read)
}

fn skip_line<R: BufRead>(reader: &mut R) -> io::Result<usize> {
    let mut skipped = 0;
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if available.is_empty() {
            return Ok(skipped);
        }
        match available.iter().position(|&byte| byte == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(skipped + end + 1);
            }
            None => {
                let len = available.len();
                reader.consume(len);
                skipped += len;
            }
        }
    }
}

fn create_fifo(path: &Path, mode: u32) -> Result<(), ChannelError> {
    let create_error = |source| ChannelError::CreatePipe {
        path: path.to_path_buf(),
        source,
    };

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => {
            debug!(path = %path.display(), "Replacing leftover request pipe");
            fs::remove_file(path).map_err(create_error)?;
        }
        Ok(_) => {
            return Err(create_error(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "path exists and is not a FIFO",
            )))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(create_error(err)),
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| create_error(io::Error::new(io::ErrorKind::InvalidInput, err)))?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the call's duration.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), mode as libc::mode_t) };
    if rc != 0 {
        return Err(create_error(io::Error::last_os_error()));
    }

    // mkfifo honours the umask; apply the configured mode exactly.
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(create_error)
}

/// Unblocks the channel reader during shutdown.
#[derive(Debug, Clone)]
pub struct ChannelWaker {
    pipe: PathBuf,
}

impl ChannelWaker {
    pub fn wake(&self) {
        let result = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.pipe)
            .and_then(|mut pipe| pipe.write_all(b"\n"));
        if let Err(err) = result {
            debug!(error = %err, "Channel wake write failed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplyWriter {
    dir: PathBuf,
}

impl ReplyWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn write(&self, request_id: &str, reply: &Reply) -> Result<(), ChannelError> {
        let path = self.dir.join(request_id);
        let tmp_path = self.dir.join(format!(".{request_id}.tmp"));
        let to_error = |source| ChannelError::Reply {
            path: path.clone(),
            source,
        };

        fs::write(&tmp_path, reply.encode()).map_err(to_error)?;
        if let Err(err) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(to_error(err));
        }
        Ok(())
    }

    /// Removes replies nobody collected. Returns how many were removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(error = %err, "Failed to list replies");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let Ok(modified) = entry.metadata().and_then(|meta| meta.modified()) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= max_age && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Pruned uncollected replies");
        }
        removed
    }
}
