//! Daemon configuration.
//!
//! Loaded from TOML; every section and field is optional. The bad-route
//! pattern and the corrective frames depend on the installation's HDMI
//! topology, so they live here rather than in code.
//!
//! ```toml
//! [bus]
//! command = ["cec-client", "-t", "r", "-o", "cecd", "-d", "9"]
//! audio_system_address = 5
//!
//! [correction]
//! bad_physical_address = "8xxx"
//! assign_frame = "1f:84:11:00:01"
//! activate_frames = ["1f:82:11:00"]
//! ```

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "CECD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cecd/config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bus: BusConfig,
    pub correction: CorrectionConfig,
    pub channel: ChannelConfig,
    pub idle: IdleConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Adapter process; must speak `cec-client`'s stdin/stdout protocol.
    pub command: Vec<String>,
    pub own_logical_address: u8,
    /// Announced when we claim or give up the active source.
    pub own_physical_address: String,
    pub audio_system_address: u8,
    /// The adapter must still be running this long after spawn.
    pub open_grace_ms: u64,
    /// How long a `tx` waits for the adapter to echo or refuse the frame.
    pub transmit_ack_timeout_ms: u64,
    pub send_retries: u32,
    pub send_retry_delay_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub event_queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            command: ["cec-client", "-t", "r", "-o", "cecd", "-d", "9"]
                .into_iter()
                .map(String::from)
                .collect(),
            own_logical_address: 1,
            own_physical_address: "1100".to_string(),
            audio_system_address: 5,
            open_grace_ms: 1500,
            transmit_ack_timeout_ms: 1000,
            send_retries: 3,
            send_retry_delay_ms: 100,
            reconnect_attempts: 5,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 8000,
            event_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorrectionConfig {
    pub enabled: bool,
    pub bad_physical_address: String,
    /// Announces our own physical address; sent until it has succeeded once.
    pub assign_frame: Option<String>,
    pub activate_frames: Vec<String>,
    pub debounce_ms: u64,
    pub transition_timeout_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bad_physical_address: "8000".to_string(),
            assign_frame: Some("1f:84:11:00:01".to_string()),
            activate_frames: vec!["1f:82:11:00".to_string()],
            debounce_ms: 2000,
            transition_timeout_ms: 5000,
            retry_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// Defaults to `$CECD_RUNTIME_DIR`, then `/run/cecd`.
    pub dir: Option<PathBuf>,
    pub pipe_mode: u32,
    pub reply_max_age_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            dir: None,
            pipe_mode: 0o660,
            reply_max_age_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdleConfig {
    /// Prints the input idle time in milliseconds.
    pub probe_command: Vec<String>,
    pub blank_after_secs: u64,
    pub poll_interval_ms: u64,
    pub max_probe_failures: u32,
    pub blank_frames: Vec<String>,
    pub wake_frames: Vec<String>,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            probe_command: vec!["xprintidle".to_string()],
            blank_after_secs: 600,
            poll_interval_ms: 1000,
            max_probe_failures: 5,
            blank_frames: vec!["10:36".to_string()],
            wake_frames: vec!["10:04".to_string(), "1f:82:11:00".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub file: Option<PathBuf>,
}

pub fn default_config_path() -> PathBuf {
    match env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

pub fn load(path: Option<PathBuf>) -> Result<Config, ConfigError> {
    let config_path = path.unwrap_or_else(default_config_path);
    if !config_path.exists() {
        return Ok(Config::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    parse(&content, &config_path)
}

pub fn parse(content: &str, path: &Path) -> Result<Config, ConfigError> {
    toml::from_str::<Config>(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load(Some(dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.bus.audio_system_address, 5);
        assert_eq!(config.correction.activate_frames, vec!["1f:82:11:00"]);
        assert_eq!(config.channel.pipe_mode, 0o660);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = parse(
            r#"
            [bus]
            command = ["/usr/local/bin/fake-cec"]
            send_retries = 1

            [correction]
            bad_physical_address = "8xxx"
            assign_frame = "4f:84:22:00:04"
            "#,
            Path::new("inline.toml"),
        )
        .unwrap();

        assert_eq!(config.bus.command, vec!["/usr/local/bin/fake-cec"]);
        assert_eq!(config.bus.send_retries, 1);
        assert_eq!(config.bus.reconnect_attempts, 5);
        assert_eq!(config.correction.bad_physical_address, "8xxx");
        assert_eq!(config.correction.assign_frame.as_deref(), Some("4f:84:22:00:04"));
        assert_eq!(config.correction.debounce_ms, 2000);
        assert_eq!(config.idle.blank_frames, vec!["10:36"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse("[bus]\nretries = 3\n", Path::new("typo.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn reads_file_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[channel]\ndir = \"/tmp/cecd-test\"\npipe_mode = 0o600\n").unwrap();

        let config = load(Some(path)).unwrap();
        assert_eq!(config.channel.dir, Some(PathBuf::from("/tmp/cecd-test")));
        assert_eq!(config.channel.pipe_mode, 0o600);
    }
}
