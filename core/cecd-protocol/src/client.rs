//! Client side of the command channel.
//!
//! A request is written to the daemon's pipe while holding the writer lock,
//! then the client waits for `replies/<request_id>` to appear. The daemon
//! renames replies into place, so an existing reply file is always complete.

use fs_err as fs;
use rand::RngCore;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::lock::{LockError, LockOptions, WriterLock};
use crate::{ChannelPaths, Command, CommandKind, ProtocolError, Reply, MAX_REQUEST_BYTES};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cecd is not running (nothing is reading {0})")]
    NotRunning(PathBuf),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("request pipe {path} stayed full for {waited:?}")]
    PipeFull { path: PathBuf, waited: Duration },

    #[error("no reply to request {request_id} within {timeout:?}")]
    ReplyTimeout {
        request_id: String,
        timeout: Duration,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub lock: LockOptions,
    pub reply_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            lock: LockOptions::default(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

pub fn new_request_id() -> String {
    format!("{}-{:08x}", std::process::id(), rand::thread_rng().next_u32())
}

#[derive(Debug, Clone)]
pub struct ChannelClient {
    paths: ChannelPaths,
    options: ClientOptions,
}

impl ChannelClient {
    pub fn new(paths: ChannelPaths, options: ClientOptions) -> Self {
        Self { paths, options }
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    pub fn send(&self, kind: CommandKind, payload: Option<String>) -> Result<Reply, ClientError> {
        let command = Command::new(kind, new_request_id(), payload)?;
        self.submit(&command)?;
        self.await_reply(&command.request_id)
    }

    /// Writes one request record under the writer lock.
    pub fn submit(&self, command: &Command) -> Result<(), ClientError> {
        let record = command.encode();
        if record.len() > MAX_REQUEST_BYTES {
            return Err(ProtocolError::TooLarge(record.len()).into());
        }

        let lock = WriterLock::acquire(&self.paths.lock_file(), self.options.lock)?;
        let result = write_record(
            &self.paths.request_pipe(),
            record.as_bytes(),
            self.options.lock.timeout,
        );
        lock.release();

        if result.is_ok() {
            debug!(request_id = %command.request_id, kind = %command.kind, "Request submitted");
        }
        result
    }

    pub fn await_reply(&self, request_id: &str) -> Result<Reply, ClientError> {
        let path = self.paths.reply_file(request_id);
        let deadline = Instant::now() + self.options.reply_timeout;

        loop {
            match fs::read_to_string(&path) {
                Ok(content) => {
                    if let Err(err) = fs::remove_file(&path) {
                        debug!(error = %err, "Failed to remove consumed reply");
                    }
                    return Ok(Reply::parse(&content)?);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(ClientError::Io { path, source }),
            }

            if Instant::now() >= deadline {
                return Err(ClientError::ReplyTimeout {
                    request_id: request_id.to_string(),
                    timeout: self.options.reply_timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn write_record(pipe: &Path, record: &[u8], budget: Duration) -> Result<(), ClientError> {
    // Non-blocking open fails with ENXIO when no daemon holds the read end.
    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(pipe)
    {
        Ok(file) => file,
        Err(err)
            if err.kind() == io::ErrorKind::NotFound
                || err.raw_os_error() == Some(libc::ENXIO) =>
        {
            return Err(ClientError::NotRunning(pipe.to_path_buf()))
        }
        Err(source) => {
            return Err(ClientError::Io {
                path: pipe.to_path_buf(),
                source,
            })
        }
    };

    let started = Instant::now();
    loop {
        match file.write(record) {
            Ok(written) if written == record.len() => return Ok(()),
            Ok(written) => {
                return Err(ClientError::Io {
                    path: pipe.to_path_buf(),
                    source: io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short write of {written}/{} bytes", record.len()),
                    ),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if started.elapsed() >= budget {
                    return Err(ClientError::PipeFull {
                        path: pipe.to_path_buf(),
                        waited: started.elapsed(),
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                return Err(ClientError::NotRunning(pipe.to_path_buf()))
            }
            Err(source) => {
                return Err(ClientError::Io {
                    path: pipe.to_path_buf(),
                    source,
                })
            }
        }
    }
}
