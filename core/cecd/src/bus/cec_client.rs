//! Bus adapter backed by a `cec-client` child process.
//!
//! Frames go out as `tx <frame>` lines on stdin. Everything the process
//! prints is classified on a reader thread and handed to the registry.
//!
//! `cec-client` answers a `tx` asynchronously: the frame is echoed as
//! `<< frame` traffic once the bus accepted it, or a `not acked` line is
//! printed. `transmit` waits for one of those before returning. An adapter
//! that prints neither (traffic logging disabled) is trusted after
//! `ack_timeout`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{BusAdapter, BusNotification, HandlerRegistry, LogLevel};
use crate::cec::CecFrame;
use crate::error::{ConnectionError, TransmitError};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

static TX_BUSY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bus busy|line busy|arbitration lost|collision)\b")
        .expect("busy regex is valid")
});

static TX_NACK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(not acked|nacked|transmit failed|failed to transmit)\b")
        .expect("nack regex is valid")
});

static LOG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(ERROR|WARNING|NOTICE|TRAFFIC|DEBUG):\s*\[\s*\d+\]\s*(.*)$")
        .expect("log line regex is valid")
});

pub struct CecClientAdapter {
    command: Vec<String>,
    open_grace: Duration,
    ack_timeout: Duration,
    session: Option<Session>,
}

/// The `tx` currently waiting for the adapter's verdict.
struct PendingTransmit {
    frame: String,
    outcome: Sender<Result<(), TransmitError>>,
}

type PendingSlot = Arc<Mutex<Option<PendingTransmit>>>;

struct Session {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
    pending: PendingSlot,
    /// Set once startup succeeded; EOF before that is reported by `open`.
    armed: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
}

impl CecClientAdapter {
    pub fn new(command: Vec<String>, open_grace: Duration, ack_timeout: Duration) -> Self {
        Self {
            command,
            open_grace,
            ack_timeout,
            session: None,
        }
    }

    fn spawn(&self) -> Result<Child, ConnectionError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ConnectionError::Unavailable("adapter command is empty".to_string()))?;

        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| ConnectionError::Unavailable(format!("{program}: {err}")))
    }
}

impl BusAdapter for CecClientAdapter {
    fn open(&mut self, registry: Arc<HandlerRegistry>) -> Result<(), ConnectionError> {
        if self.session.is_some() {
            return Ok(());
        }

        let mut child = self.spawn()?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ConnectionError::Unavailable(
                    "adapter pipes were not captured".to_string(),
                ));
            }
        };

        let armed = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));
        let pending: PendingSlot = Arc::new(Mutex::new(None));
        let reader = spawn_reader(
            stdout,
            registry,
            Arc::clone(&pending),
            Arc::clone(&armed),
            Arc::clone(&closing),
        );
        let mut session = Session {
            child,
            stdin: Some(stdin),
            reader: Some(reader),
            pending,
            armed,
            closing,
        };

        let deadline = Instant::now() + self.open_grace;
        loop {
            if let Some(status) = exited(&mut session.child) {
                session.shutdown();
                return Err(ConnectionError::ExitedEarly(status));
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        session.armed.store(true, Ordering::SeqCst);
        // The reader may have hit EOF before it was armed.
        if let Some(status) = exited(&mut session.child) {
            session.shutdown();
            return Err(ConnectionError::ExitedEarly(status));
        }

        debug!(pid = session.child.id(), "cec-client started");
        self.session = Some(session);
        Ok(())
    }

    fn transmit(&mut self, frame: &CecFrame) -> Result<(), TransmitError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| TransmitError::Disconnected("adapter is not open".to_string()))?;

        if let Some(status) = exited(&mut session.child) {
            return Err(TransmitError::Disconnected(status));
        }

        let stdin = session
            .stdin
            .as_mut()
            .ok_or_else(|| TransmitError::Disconnected("adapter stdin closed".to_string()))?;

        let (outcome, verdict) = mpsc::channel();
        *lock_slot(&session.pending) = Some(PendingTransmit {
            frame: frame.to_string(),
            outcome,
        });
        if let Err(err) = writeln!(stdin, "tx {frame}").and_then(|()| stdin.flush()) {
            lock_slot(&session.pending).take();
            return Err(classify_write_error(err));
        }

        let result = match verdict.recv_timeout(self.ack_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                debug!(%frame, "No transmit confirmation from cec-client");
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransmitError::Disconnected(
                "adapter output closed".to_string(),
            )),
        };
        lock_slot(&session.pending).take();
        result
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown();
        }
    }

    fn describe(&self) -> String {
        self.command.join(" ")
    }
}

impl Drop for CecClientAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

impl Session {
    fn shutdown(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(mut stdin) = self.stdin.take() {
            let _ = writeln!(stdin, "q");
            let _ = stdin.flush();
        }

        let deadline = Instant::now() + QUIT_TIMEOUT;
        while exited(&mut self.child).is_none() {
            if Instant::now() >= deadline {
                warn!(pid = self.child.id(), "cec-client ignored quit; killing");
                let _ = self.child.kill();
                let _ = self.child.wait();
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn lock_slot(slot: &PendingSlot) -> std::sync::MutexGuard<'_, Option<PendingTransmit>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn exited(child: &mut Child) -> Option<String> {
    match child.try_wait() {
        Ok(Some(status)) => Some(status.to_string()),
        Ok(None) => None,
        Err(err) => Some(err.to_string()),
    }
}

fn classify_write_error(err: io::Error) -> TransmitError {
    match err.kind() {
        io::ErrorKind::BrokenPipe => TransmitError::Disconnected(err.to_string()),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
            TransmitError::Busy(err.to_string())
        }
        _ => TransmitError::Failed(err.to_string()),
    }
}

fn spawn_reader(
    stdout: ChildStdout,
    registry: Arc<HandlerRegistry>,
    pending: PendingSlot,
    armed: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let reason = loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break "adapter output closed".to_string(),
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    if let Some(notification) = classify_line(&line) {
                        settle_pending(&pending, &notification);
                        registry.dispatch(&notification);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break format!("adapter read failed: {err}"),
            }
        };

        // Dropping the sender wakes a transmit still waiting for its verdict.
        lock_slot(&pending).take();
        if armed.load(Ordering::SeqCst) && !closing.load(Ordering::SeqCst) {
            warn!(reason, "CEC adapter connection lost");
            registry.dispatch(&BusNotification::ConnectionLost(reason));
        }
    })
}

/// Completes the pending transmit if `notification` is its verdict.
fn settle_pending(pending: &PendingSlot, notification: &BusNotification) {
    let mut slot = lock_slot(pending);
    let Some(waiting) = slot.as_ref() else {
        return;
    };
    let Some(result) = transmit_outcome(notification, &waiting.frame) else {
        return;
    };
    if let Some(waiting) = slot.take() {
        let _ = waiting.outcome.send(result);
    }
}

/// What a line of adapter output says about the frame `frame` being sent.
fn transmit_outcome(
    notification: &BusNotification,
    frame: &str,
) -> Option<Result<(), TransmitError>> {
    let BusNotification::Log { level, message } = notification else {
        return None;
    };
    match level {
        LogLevel::Traffic => {
            let echoed = message.strip_prefix("<<")?.trim();
            echoed.eq_ignore_ascii_case(frame).then_some(Ok(()))
        }
        LogLevel::Notice => None,
        _ if TX_NACK.is_match(message) => Some(Err(TransmitError::Failed(message.clone()))),
        _ if TX_BUSY.is_match(message) => Some(Err(TransmitError::Busy(message.clone()))),
        _ => None,
    }
}

/// Maps one line of adapter output to a notification. Blank lines yield
/// nothing.
pub fn classify_line(line: &str) -> Option<BusNotification> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    let Some(captures) = LOG_LINE.captures(line) else {
        return Some(BusNotification::Log {
            level: LogLevel::Debug,
            message: line.trim().to_string(),
        });
    };

    let message = captures[2].trim();
    let level = match &captures[1] {
        "ERROR" => LogLevel::Error,
        "WARNING" => LogLevel::Warning,
        "NOTICE" => LogLevel::Notice,
        "TRAFFIC" => LogLevel::Traffic,
        _ => LogLevel::Debug,
    };

    if level == LogLevel::Traffic {
        if let Some(frame) = message.strip_prefix(">>") {
            return Some(BusNotification::Traffic(frame.trim().to_string()));
        }
    }
    if level == LogLevel::Error && message.to_ascii_lowercase().contains("connection lost") {
        return Some(BusNotification::ConnectionLost(message.to_string()));
    }

    Some(BusNotification::Log {
        level,
        message: message.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventCategory;
    use std::sync::Mutex;

    #[test]
    fn classifies_received_traffic() {
        assert_eq!(
            classify_line("TRAFFIC: [          406]\t>> 5f:72:01\n"),
            Some(BusNotification::Traffic("5f:72:01".to_string()))
        );
    }

    #[test]
    fn transmitted_traffic_is_only_logged() {
        assert_eq!(
            classify_line("TRAFFIC: [   12]\t<< 1f:82:11:00"),
            Some(BusNotification::Log {
                level: LogLevel::Traffic,
                message: "<< 1f:82:11:00".to_string()
            })
        );
    }

    #[test]
    fn connection_lost_errors_become_alerts() {
        let notification = classify_line("ERROR:   [  9001]\tconnection lost").unwrap();
        assert!(matches!(notification, BusNotification::ConnectionLost(_)));

        let other = classify_line("ERROR:   [  9001]\tcould not open a connection").unwrap();
        assert!(matches!(
            other,
            BusNotification::Log {
                level: LogLevel::Error,
                ..
            }
        ));
    }

    #[test]
    fn free_text_and_blank_lines() {
        assert_eq!(classify_line("\r\n"), None);
        assert_eq!(
            classify_line("waiting for input"),
            Some(BusNotification::Log {
                level: LogLevel::Debug,
                message: "waiting for input".to_string()
            })
        );
    }

    fn collecting_registry() -> (Arc<HandlerRegistry>, Arc<Mutex<Vec<BusNotification>>>) {
        let registry = Arc::new(HandlerRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for category in [EventCategory::Traffic, EventCategory::Log, EventCategory::Alert] {
            let seen = Arc::clone(&seen);
            registry.register(category, move |notification| {
                seen.lock().unwrap().push(notification.clone());
            });
        }
        (registry, seen)
    }

    #[test]
    fn transmits_through_child_stdin() {
        let (registry, seen) = collecting_registry();
        let mut adapter = CecClientAdapter::new(
            vec!["cat".to_string()],
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        adapter.open(registry).unwrap();

        adapter.transmit(&"10:36".parse().unwrap()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        adapter.close();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.first(),
            Some(&BusNotification::Log {
                level: LogLevel::Debug,
                message: "tx 10:36".to_string()
            })
        );
        assert!(!seen
            .iter()
            .any(|n| matches!(n, BusNotification::ConnectionLost(_))));
    }

    /// Answers like `cec-client`: echoes accepted frames, refuses `10:36`
    /// and reports a busy bus for `10:04`.
    const ANSWERING_ADAPTER: &str = r#"
while read -r cmd frame; do
  case "$frame" in
    10:36) printf "command 'tx %s' was not acked by the controller\n" "$frame" ;;
    10:04) printf 'ERROR:   [   12]\tbus busy, retry later\n' ;;
    *) printf 'TRAFFIC: [   12]\t<< %s\n' "$frame" ;;
  esac
done
"#;

    #[test]
    fn transmit_reports_adapter_verdict() {
        let (registry, _seen) = collecting_registry();
        let mut adapter = CecClientAdapter::new(
            vec!["sh".to_string(), "-c".to_string(), ANSWERING_ADAPTER.to_string()],
            Duration::from_millis(50),
            Duration::from_secs(2),
        );
        adapter.open(registry).unwrap();

        assert_eq!(adapter.transmit(&"1f:82:11:00".parse().unwrap()), Ok(()));
        assert!(matches!(
            adapter.transmit(&"10:36".parse().unwrap()),
            Err(TransmitError::Failed(message)) if message.contains("not acked")
        ));
        assert!(matches!(
            adapter.transmit(&"10:04".parse().unwrap()),
            Err(TransmitError::Busy(_))
        ));
        assert_eq!(adapter.transmit(&"15:71".parse().unwrap()), Ok(()));
        adapter.close();
    }

    #[test]
    fn outcome_matching() {
        let echo = |message: &str| BusNotification::Log {
            level: LogLevel::Traffic,
            message: message.to_string(),
        };
        assert_eq!(transmit_outcome(&echo("<< 1f:82:11:00"), "1f:82:11:00"), Some(Ok(())));
        assert_eq!(transmit_outcome(&echo("<< 10:36"), "1f:82:11:00"), None);
        assert_eq!(transmit_outcome(&echo(">> 1f:82:11:00"), "1f:82:11:00"), None);

        let nack = classify_line("ERROR:   [  88]\tcommand 'tx 10:36' was not acked").unwrap();
        assert!(matches!(
            transmit_outcome(&nack, "10:36"),
            Some(Err(TransmitError::Failed(_)))
        ));
        let unrelated = classify_line("NOTICE:  [  88]\tbus busy? no").unwrap();
        assert_eq!(transmit_outcome(&unrelated, "10:36"), None);
    }

    #[test]
    fn early_exit_fails_open() {
        let (registry, seen) = collecting_registry();
        let mut adapter = CecClientAdapter::new(
            vec!["true".to_string()],
            Duration::from_millis(300),
            Duration::from_millis(50),
        );
        let err = adapter.open(registry).unwrap_err();
        assert!(matches!(err, ConnectionError::ExitedEarly(_)));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let mut adapter = CecClientAdapter::new(
            vec!["/nonexistent/cec-client".to_string()],
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let err = adapter.open(Arc::new(HandlerRegistry::new())).unwrap_err();
        assert!(matches!(err, ConnectionError::Unavailable(_)));
        assert!(matches!(
            adapter.transmit(&"10:36".parse().unwrap()),
            Err(TransmitError::Disconnected(_))
        ));
    }
}
