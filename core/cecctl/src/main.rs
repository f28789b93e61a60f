//! cecctl: send one command to a running cecd.
//!
//! Every subcommand becomes a single request on the daemon's command channel.
//! The reply data is printed on stdout; an `ERROR:` reply or a channel
//! failure is printed on stderr with a non-zero exit status.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cecd_protocol::client::{ChannelClient, ClientError, ClientOptions};
use cecd_protocol::{ChannelPaths, CommandKind, Reply};

#[derive(Parser)]
#[command(name = "cecctl")]
#[command(about = "Control the cecd CEC bus daemon")]
#[command(version)]
struct Cli {
    /// Daemon runtime directory (defaults to $CECD_RUNTIME_DIR, then /run/cecd)
    #[arg(long, value_name = "DIR", global = true)]
    runtime_dir: Option<PathBuf>,

    /// Seconds to wait for the daemon's reply
    #[arg(long, value_name = "SECS", default_value_t = 5, global = true)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Raise the audio system volume
    VolumeUp {
        /// Number of key presses (1-20)
        steps: Option<u32>,
    },

    /// Lower the audio system volume
    VolumeDown {
        /// Number of key presses (1-20)
        steps: Option<u32>,
    },

    /// Toggle audio mute
    Mute,

    /// Force the audio path back to passthrough
    ForcePassthrough,

    /// Print the daemon's status as JSON
    Status,

    /// Start the idle-screen task
    IdleStart {
        /// Blank the display after this many idle seconds
        seconds: Option<u64>,
    },

    /// Stop the idle-screen task
    IdleStop,

    /// Put a device into standby (default: TV)
    Standby {
        /// Logical address (0-15)
        address: Option<String>,
    },

    /// Power a device on (default: TV)
    On {
        /// Logical address (0-15)
        address: Option<String>,
    },

    /// Announce this device as the active source
    ActiveSource,

    /// Tell the TV this device is no longer the source
    InactiveSource,

    /// Put the TV into standby if this device is the active source
    SleepTv,

    /// Transmit a raw frame, e.g. `1f:82:11:00`
    Tx {
        #[arg(value_name = "FRAME")]
        frame: String,
    },
}

impl Commands {
    fn request(self) -> (CommandKind, Option<String>) {
        match self {
            Commands::VolumeUp { steps } => (CommandKind::VolumeUp, steps.map(|n| n.to_string())),
            Commands::VolumeDown { steps } => {
                (CommandKind::VolumeDown, steps.map(|n| n.to_string()))
            }
            Commands::Mute => (CommandKind::Mute, None),
            Commands::ForcePassthrough => (CommandKind::ForcePassthrough, None),
            Commands::Status => (CommandKind::StatusQuery, None),
            Commands::IdleStart { seconds } => {
                (CommandKind::StartIdleTask, seconds.map(|s| s.to_string()))
            }
            Commands::IdleStop => (CommandKind::StopIdleTask, None),
            Commands::Standby { address } => (CommandKind::Standby, address),
            Commands::On { address } => (CommandKind::PowerOn, address),
            Commands::ActiveSource => (CommandKind::ActiveSource, None),
            Commands::InactiveSource => (CommandKind::InactiveSource, None),
            Commands::SleepTv => (CommandKind::SleepTv, None),
            Commands::Tx { frame } => (CommandKind::Transmit, Some(frame)),
        }
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = match cli.runtime_dir {
        Some(dir) => ChannelPaths::new(dir),
        None => ChannelPaths::from_env(),
    };
    let options = ClientOptions {
        reply_timeout: Duration::from_secs(cli.timeout),
        ..ClientOptions::default()
    };
    let client = ChannelClient::new(paths, options);
    let (kind, payload) = cli.command.request();

    match client.send(kind, payload) {
        Ok(reply) => std::process::exit(print_reply(kind, &reply)),
        Err(err) => {
            tracing::error!(error = %err, kind = %kind, "Request failed");
            eprintln!("cecctl: {err}");
            std::process::exit(exit_code(&err));
        }
    }
}

fn print_reply(kind: CommandKind, reply: &Reply) -> i32 {
    match reply {
        Reply::Ok(None) => 0,
        Reply::Ok(Some(data)) if kind == CommandKind::StatusQuery => {
            match serde_json::from_str::<serde_json::Value>(data)
                .and_then(|value| serde_json::to_string_pretty(&value))
            {
                Ok(pretty) => println!("{pretty}"),
                Err(_) => println!("{data}"),
            }
            0
        }
        Reply::Ok(Some(data)) => {
            println!("{data}");
            0
        }
        Reply::Error(message) => {
            eprintln!("cecd: {message}");
            1
        }
    }
}

fn exit_code(err: &ClientError) -> i32 {
    match err {
        ClientError::NotRunning(_) => 3,
        ClientError::Lock(_) | ClientError::PipeFull { .. } | ClientError::ReplyTimeout { .. } => 4,
        ClientError::Protocol(_) => 2,
        ClientError::Io { .. } => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_map_to_requests() {
        let cli = Cli::parse_from(["cecctl", "volume-up", "3"]);
        assert_eq!(
            cli.command.request(),
            (CommandKind::VolumeUp, Some("3".to_string()))
        );

        let cli = Cli::parse_from(["cecctl", "--timeout", "1", "tx", "1f:82:11:00"]);
        assert_eq!(cli.timeout, 1);
        assert_eq!(
            cli.command.request(),
            (CommandKind::Transmit, Some("1f:82:11:00".to_string()))
        );

        let cli = Cli::parse_from(["cecctl", "status"]);
        assert_eq!(cli.command.request(), (CommandKind::StatusQuery, None));

        let cli = Cli::parse_from(["cecctl", "sleep-tv"]);
        assert_eq!(cli.command.request(), (CommandKind::SleepTv, None));
        assert!(Cli::try_parse_from(["cecctl", "active-source", "now"]).is_err());
    }

    #[test]
    fn error_replies_fail() {
        assert_eq!(print_reply(CommandKind::Mute, &Reply::error("bus unavailable")), 1);
        assert_eq!(print_reply(CommandKind::Mute, &Reply::ok_with("34")), 0);
    }
}
