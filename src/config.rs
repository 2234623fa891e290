//! Typed configuration (§6), mirroring this codebase's own `clap` + `serde`
//! config struct pattern (see `discovery::config`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_wire_protocol() -> WireProtocol {
    WireProtocol::C
}

fn default_max_epoch_size() -> u32 {
    2048
}

fn default_ko_count() -> u32 {
    7
}

fn default_timeout_ms() -> u64 {
    6000
}

fn default_sync_rate_bytes_per_sec() -> u32 {
    10 * 1024 * 1024
}

fn default_sync_al_extents() -> u32 {
    127
}

/// Wire protocol level, deciding when a local write is considered complete
/// (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum WireProtocol {
    /// Complete after local disk completion only.
    A,
    /// Complete after the peer's `RecvAck`.
    B,
    /// Complete after the peer's `WriteAck` (synchronous).
    C,
}

/// Local-disk failure policy (§7 `LocalIoError`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum OnIoError {
    /// Propagate the error to the caller.
    PassOn,
    /// Treat as fatal.
    Panic,
    /// Detach the local disk and continue as diskless.
    Detach,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_rate_bytes_per_sec")]
    pub rate_bytes_per_sec: u32,
    #[serde(default)]
    pub use_csums: bool,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub group: u16,
    #[serde(default = "default_sync_al_extents")]
    pub al_extents: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rate_bytes_per_sec: default_sync_rate_bytes_per_sec(),
            use_csums: false,
            skip: false,
            group: 0,
            al_extents: default_sync_al_extents(),
        }
    }
}

#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_wire_protocol")]
    #[clap(long, value_enum, default_value_t = WireProtocol::C)]
    pub wire_protocol: WireProtocol,

    #[serde(default)]
    #[clap(long)]
    pub two_primaries: bool,

    #[serde(default = "default_max_epoch_size")]
    #[clap(long, default_value_t = default_max_epoch_size())]
    pub max_epoch_size: u32,

    #[serde(default = "default_ko_count")]
    #[clap(long, default_value_t = default_ko_count())]
    pub ko_count: u32,

    #[serde(default = "default_timeout_ms")]
    #[clap(long, default_value_t = default_timeout_ms())]
    pub timeout_ms: u64,

    #[serde(default)]
    #[clap(long, value_enum, default_value_t = OnIoError::Detach)]
    pub on_io_error: OnIoError,

    #[serde(flatten)]
    #[clap(flatten)]
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wire_protocol: default_wire_protocol(),
            two_primaries: false,
            max_epoch_size: default_max_epoch_size(),
            ko_count: default_ko_count(),
            timeout_ms: default_timeout_ms(),
            on_io_error: OnIoError::Detach,
            sync: SyncConfig::default(),
        }
    }
}

impl Default for OnIoError {
    fn default() -> Self {
        OnIoError::Detach
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Ping interval is half the meta-channel timeout (§6).
    pub fn ping_interval(&self) -> Duration {
        self.timeout() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_protocol_c_and_detach() {
        let config = Config::default();
        assert_eq!(config.wire_protocol, WireProtocol::C);
        assert_eq!(config.on_io_error, OnIoError::Detach);
        assert!(!config.two_primaries);
    }

    #[test]
    fn ping_interval_is_half_of_timeout() {
        let config = Config::default();
        assert_eq!(config.ping_interval(), config.timeout() / 2);
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.max_epoch_size, config.max_epoch_size);
    }
}
