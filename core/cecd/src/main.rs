//! cecd: single owner of the CEC bus.
//!
//! Holds the only connection to the bus adapter, corrects the audio signal
//! path when the TV tries to steal it, and serves short-lived `cecctl`
//! invocations over a lock-arbitrated command channel.

mod backoff;
mod bus;
mod cec;
mod channel;
mod config;
mod corrector;
mod dispatcher;
mod error;
mod idle;
mod instance;
mod logging;
mod shutdown;
mod trace;

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use cecd_protocol::ChannelPaths;

use backoff::ReconnectPolicy;
use bus::{
    BusConnection, BusNotification, CecClientAdapter, EventCategory, HandlerRegistry, LogLevel,
    SendPolicy,
};
use cec::{LogicalAddress, PhysicalAddress};
use channel::ChannelServer;
use config::Config;
use corrector::{Corrector, CorrectorSettings};
use dispatcher::{DispatchItem, Dispatcher, DispatcherSettings};
use error::{ConfigError, DaemonError};
use idle::{CommandInputProbe, IdleController, IdleSettings, InputProbe};
use instance::InstanceGuard;

#[derive(Parser)]
#[command(name = "cecd")]
#[command(about = "CEC bus daemon with signal-path auto-correction")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $CECD_CONFIG, then /etc/cecd/config.toml)
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Runtime directory for the command channel (overrides the config)
    #[arg(long, value_name = "DIR")]
    runtime_dir: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let config = config::load(cli.config);
    let log_file = config
        .as_ref()
        .ok()
        .and_then(|config| config.logging.file.clone());
    let _logging_guard = logging::init(log_file.as_deref());

    let config = match config {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load config");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config, cli.runtime_dir) {
        error!(error = %err, "cecd failed to start");
        std::process::exit(1);
    }
}

fn run(config: Config, runtime_dir: Option<PathBuf>) -> Result<(), DaemonError> {
    let paths = match runtime_dir.or_else(|| config.channel.dir.clone()) {
        Some(dir) => ChannelPaths::new(dir),
        None => ChannelPaths::from_env(),
    };
    let instance = InstanceGuard::acquire(paths.dir())?;

    let corrector_settings =
        CorrectorSettings::from_config(&config.correction, config.bus.audio_system_address)?;
    let idle_settings = IdleSettings::from_config(&config.idle)?;
    let own_address = LogicalAddress::new(config.bus.own_logical_address).ok_or_else(|| {
        ConfigError::invalid("bus.own_logical_address", "must be a logical address (0..=15)")
    })?;
    let own_physical_address = config
        .bus
        .own_physical_address
        .parse::<PhysicalAddress>()
        .map_err(|err| ConfigError::invalid("bus.own_physical_address", err.to_string()))?;
    let audio_system = corrector_settings.audio_system;

    let (queue_tx, queue_rx) = mpsc::sync_channel(config.bus.event_queue_capacity.max(1));

    let adapter = CecClientAdapter::new(
        config.bus.command.clone(),
        Duration::from_millis(config.bus.open_grace_ms),
        Duration::from_millis(config.bus.transmit_ack_timeout_ms),
    );
    let bus = Arc::new(BusConnection::connect(
        Box::new(adapter),
        Arc::new(HandlerRegistry::new()),
        SendPolicy {
            retries: config.bus.send_retries,
            retry_delay: Duration::from_millis(config.bus.send_retry_delay_ms),
        },
        ReconnectPolicy {
            attempts: config.bus.reconnect_attempts,
            base_delay: Duration::from_millis(config.bus.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.bus.reconnect_max_delay_ms),
        },
    )?);
    register_bus_handlers(&bus, &queue_tx);

    let channel = ChannelServer::open(paths.clone(), config.channel.pipe_mode)?;
    let replies = channel.replies();
    let waker = channel.waker();
    let stop = Arc::new(AtomicBool::new(false));

    let signal_queue = queue_tx.clone();
    let signal_waker = waker.clone();
    let signals = shutdown::spawn_signal_watcher(Arc::clone(&stop), move || {
        let _ = signal_queue.send(DispatchItem::Shutdown);
        signal_waker.wake();
    })
    .map_err(|source| DaemonError::Spawn {
        what: "signal watcher",
        source,
    })?;

    let client_queue = queue_tx;
    let reader = channel
        .spawn_reader(Arc::clone(&stop), move |command| {
            client_queue.send(DispatchItem::Client(command)).is_ok()
        })
        .map_err(|source| DaemonError::Spawn {
            what: "channel reader",
            source,
        })?;

    let probe_command = config.idle.probe_command.clone();
    let idle = IdleController::new(
        idle_settings,
        Box::new(move || {
            Box::new(CommandInputProbe::new(probe_command.clone())) as Box<dyn InputProbe>
        }),
    );

    let dispatcher = Dispatcher::new(
        bus,
        Corrector::new(corrector_settings),
        idle,
        replies,
        DispatcherSettings {
            own_address,
            own_physical_address,
            audio_system,
            reply_max_age: Duration::from_secs(config.channel.reply_max_age_secs),
        },
        Arc::clone(&stop),
    );

    info!(
        pid = std::process::id(),
        dir = %paths.dir().display(),
        pid_file = %instance.path().display(),
        own_address = %own_address,
        own_physical_address = %own_physical_address,
        audio_system = %audio_system,
        "cecd started"
    );
    dispatcher.run(queue_rx);

    stop.store(true, Ordering::SeqCst);
    signals.close();
    waker.wake();
    if reader.join().is_err() {
        warn!("Command channel reader panicked");
    }
    info!("cecd stopped");
    Ok(())
}

/// Wires adapter notifications into the dispatch queue. Handlers run on the
/// adapter's reader thread, so they never block on a full queue.
fn register_bus_handlers(bus: &BusConnection, queue: &SyncSender<DispatchItem>) {
    let traffic_queue = queue.clone();
    bus.register(EventCategory::Traffic, move |notification| {
        let BusNotification::Traffic(line) = notification else {
            return;
        };
        if let Some(event) = trace::parse(line) {
            enqueue(&traffic_queue, DispatchItem::Bus(event));
        }
    });

    let alert_queue = queue.clone();
    bus.register(EventCategory::Alert, move |notification| {
        if let BusNotification::ConnectionLost(reason) = notification {
            enqueue(&alert_queue, DispatchItem::ConnectionLost(reason.clone()));
        }
    });

    bus.register(EventCategory::Log, |notification| {
        let BusNotification::Log { level, message } = notification else {
            return;
        };
        match level {
            LogLevel::Error | LogLevel::Warning => warn!(target: "cec_client", "{message}"),
            LogLevel::Notice => info!(target: "cec_client", "{message}"),
            LogLevel::Traffic | LogLevel::Debug => debug!(target: "cec_client", "{message}"),
        }
    });
}

fn enqueue(queue: &SyncSender<DispatchItem>, item: DispatchItem) {
    match queue.try_send(item) {
        Ok(()) => {}
        Err(TrySendError::Full(item)) => warn!(?item, "Dispatch queue full; dropping"),
        Err(TrySendError::Disconnected(_)) => debug!("Dispatcher gone; dropping bus notification"),
    }
}
