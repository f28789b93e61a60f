use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::info;

/// Watches for termination signals on a background thread. On the first one
/// `stop` is raised and `on_signal` runs once. Closing the returned handle
/// ends the watcher without running it.
pub fn spawn_signal_watcher<F>(stop: Arc<AtomicBool>, on_signal: F) -> io::Result<Handle>
where
    F: FnOnce() + Send + 'static,
{
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
    let handle = signals.handle();
    thread::Builder::new()
        .name("cecd-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Shutdown signal received");
                stop.store(true, Ordering::SeqCst);
                on_signal();
            }
        })?;
    Ok(handle)
}
