//! Agent settings
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! TOML file, then `OBD_AGENT_*` environment variables (`__` separates
//! nested keys, e.g. `OBD_AGENT_SCAN__INCLUDE_VIN=false`).

use anyhow::{bail, Context, Result};
use obd_protocol::{ConnectOptions, SerialEndpoint, DEFAULT_BAUD_RATE};
use obd_scan::{ScanOptions, DEFAULT_LIVE_PIDS, DEFAULT_MAX_FREEZE_FRAMES};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Read when no `--config` is given and the file exists
pub const DEFAULT_CONFIG_FILE: &str = "obd-agent.toml";

const ENV_PREFIX: &str = "OBD_AGENT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Port path or device address; discovered when unset
    pub port: Option<String>,
    pub baud_rate: u32,
    pub fast_init: bool,
    pub scan: ScanConfig,
    pub log: LogConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            fast_init: false,
            scan: ScanConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub include_vin: bool,
    pub include_dtcs: bool,
    pub include_readiness: bool,
    pub include_freeze_frames: bool,
    /// Mode 01 PIDs as hex, `"0C"` or `"010C"`
    pub live_pids: Vec<String>,
    pub max_freeze_frames: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include_vin: true,
            include_dtcs: true,
            include_readiness: true,
            include_freeze_frames: true,
            live_pids: DEFAULT_LIVE_PIDS
                .iter()
                .map(|p| format!("{:02X}", p.as_hex()))
                .collect(),
            max_freeze_frames: DEFAULT_MAX_FREEZE_FRAMES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Parse a Mode 01 PID given as `"0C"` or with the mode prefix, `"010C"`
pub fn parse_pid(text: &str) -> Result<u8> {
    let text = text.trim();
    let hex = match text.len() {
        2 => text,
        4 if text.starts_with("01") => &text[2..],
        _ => bail!("PID {text:?} must be two hex digits, optionally prefixed by mode 01"),
    };
    u8::from_str_radix(hex, 16).with_context(|| format!("PID {text:?} is not hex"))
}

impl AgentConfig {
    /// Load defaults, then `path` (or [`DEFAULT_CONFIG_FILE`] if present),
    /// then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("scan.live_pids"),
            )
            .build()
            .context("reading configuration sources")?;
        settings
            .try_deserialize()
            .context("invalid configuration")
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            baud_rate: self.baud_rate,
            fast_init: self.fast_init,
        }
    }

    /// Endpoint named in the configuration, if any
    pub fn endpoint(&self) -> Option<SerialEndpoint> {
        self.port.as_deref().map(SerialEndpoint::manual)
    }

    pub fn scan_options(&self) -> Result<ScanOptions> {
        let live_pids = self
            .scan
            .live_pids
            .iter()
            .map(|p| parse_pid(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(ScanOptions {
            include_vin: self.scan.include_vin,
            include_dtcs: self.scan.include_dtcs,
            include_readiness: self.scan.include_readiness,
            include_freeze_frames: self.scan.include_freeze_frames,
            live_pids,
            max_freeze_frames: self.scan.max_freeze_frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library() {
        let config = AgentConfig::default();
        assert_eq!(config.connect_options(), ConnectOptions::default());
        assert_eq!(config.scan_options().unwrap(), ScanOptions::default());
        assert!(config.endpoint().is_none());
    }

    #[test]
    fn test_parse_pid() {
        assert_eq!(parse_pid("0C").unwrap(), 0x0C);
        assert_eq!(parse_pid(" 010d ").unwrap(), 0x0D);
        assert!(parse_pid("0X").is_err());
        assert!(parse_pid("020C").is_err());
        assert!(parse_pid("C").is_err());
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join(format!("obd-agent-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
port = "/dev/rfcomm0"
fast_init = true

[scan]
live_pids = ["010C", "0D"]
max_freeze_frames = 1

[log]
json = true
"#,
        )
        .unwrap();

        let config = AgentConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(config.fast_init);
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint.kind, obd_protocol::TransportKind::Bluetooth);

        let scan = config.scan_options().unwrap();
        assert_eq!(scan.live_pids, vec![0x0C, 0x0D]);
        assert_eq!(scan.max_freeze_frames, 1);
        assert!(scan.include_vin);
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(AgentConfig::load(Some(Path::new("/nonexistent/obd-agent.toml"))).is_err());
    }
}
