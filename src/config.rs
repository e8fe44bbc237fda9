//! Configuration loading using Figment
//!
//! Configuration is loaded from:
//! 1. `config/bbsim.toml` (optional, every key has a default)
//! 2. Environment variables prefixed with `BBSIM_`, `__` separating sections
//!    (e.g. `BBSIM_OLT__PON_PORTS=4`)
//!
//! Command-line flags are applied on top by the binary.
//!
//! # Example
//! ```no_run
//! use rust_bbsim::config::SimConfig;
//!
//! let config = SimConfig::load()?;
//! config.validate()?;
//! assert!(config.olt.pon_ports > 0);
//! # Ok::<(), rust_bbsim::error::SimError>(())
//! ```

use crate::error::{SimError, SimResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/bbsim.toml";

/// Highest VLAN id usable as a tag
const MAX_VLAN: u16 = 4094;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Emulated OLT topology and ONU behaviour
    pub olt: OltConfig,
    /// Listener and worker settings
    pub server: ServerConfig,
    /// Bulk runner settings
    pub bbr: BbrConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "debug".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Emulated OLT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OltConfig {
    /// OLT id, part of every ONU serial number
    pub id: u32,
    /// Number of NNI ports
    pub nni_ports: u32,
    /// Number of PON ports
    pub pon_ports: u32,
    /// ONUs per PON port
    pub onus_per_pon: u32,
    /// Service VLAN shared by all ONUs
    pub s_tag: u16,
    /// First subscriber VLAN, incremented per ONU
    pub c_tag_init: u16,
    /// Start EAPOL automatically
    pub auth: bool,
    /// Start DHCP automatically
    pub dhcp: bool,
}

impl Default for OltConfig {
    fn default() -> Self {
        Self {
            id: 0,
            nni_ports: 1,
            pon_ports: 1,
            onus_per_pon: 1,
            s_tag: 900,
            c_tag_init: 900,
            auth: false,
            dhcp: false,
        }
    }
}

/// gRPC listeners and device workers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Openolt service address
    pub openolt_address: String,
    /// Admin API address
    pub api_address: String,
    /// Inbound queue capacity per ONU
    pub onu_queue_capacity: usize,
    /// Time allowed for workers to stop, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            openolt_address: "0.0.0.0:50060".to_string(),
            api_address: "0.0.0.0:50070".to_string(),
            onu_queue_capacity: 2048,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl ServerConfig {
    /// Parsed Openolt listen address
    pub fn openolt_addr(&self) -> SimResult<SocketAddr> {
        Ok(self.openolt_address.parse()?)
    }

    /// Parsed admin API listen address
    pub fn api_addr(&self) -> SimResult<SocketAddr> {
        Ok(self.api_address.parse()?)
    }

    /// Shutdown timeout as a duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Bulk runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BbrConfig {
    /// Endpoint of the emulator to drive
    pub olt_address: String,
    /// Time allowed for every ONU to complete DHCP, in seconds
    pub timeout_secs: u64,
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self {
            olt_address: "http://127.0.0.1:50060".to_string(),
            timeout_secs: 120,
        }
    }
}

impl BbrConfig {
    /// Completion timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SimConfig {
    /// Load configuration from `config/bbsim.toml` and environment variables
    pub fn load() -> SimResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path; a missing file yields defaults
    pub fn load_from<P: AsRef<Path>>(path: P) -> SimResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider chain, exposed so callers can merge further overrides
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(SimConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BBSIM_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> SimResult<()> {
        self.check().map_err(SimError::Configuration)
    }

    fn check(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level = self.application.log_level.to_lowercase();
        if !valid_levels.contains(&level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        // serial numbers and hardware addresses carry one byte each
        if self.olt.pon_ports == 0 || self.olt.pon_ports > 255 {
            return Err(format!("Invalid pon_ports {}. Must be 1-255", self.olt.pon_ports));
        }
        if self.olt.onus_per_pon == 0 || self.olt.onus_per_pon > 255 {
            return Err(format!(
                "Invalid onus_per_pon {}. Must be 1-255",
                self.olt.onus_per_pon
            ));
        }
        if self.olt.id > 255 {
            return Err(format!("Invalid olt id {}. Must be 0-255", self.olt.id));
        }

        if !(1..=MAX_VLAN).contains(&self.olt.s_tag) {
            return Err(format!("Invalid s_tag {}. Must be 1-{MAX_VLAN}", self.olt.s_tag));
        }
        let onus = self.olt.pon_ports * self.olt.onus_per_pon;
        let last_c_tag = u32::from(self.olt.c_tag_init) + onus - 1;
        if self.olt.c_tag_init == 0 || last_c_tag > u32::from(MAX_VLAN) {
            return Err(format!(
                "Invalid c_tag_init {}. {} ONUs need tags up to {}, must stay within 1-{MAX_VLAN}",
                self.olt.c_tag_init, onus, last_c_tag
            ));
        }

        if self.server.onu_queue_capacity == 0 {
            return Err("onu_queue_capacity must be greater than 0".to_string());
        }
        for (name, address) in [
            ("openolt_address", &self.server.openolt_address),
            ("api_address", &self.server.api_address),
        ] {
            if address.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid {name} '{address}'"));
            }
        }

        Ok(())
    }

    /// Subscriber VLAN of the `index`-th ONU across the whole OLT
    pub fn c_tag_for(&self, index: u32) -> u16 {
        // validate() keeps this within range
        self.olt.c_tag_init.saturating_add(index.min(u32::from(u16::MAX)) as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.olt.s_tag, 900);
        assert_eq!(config.server.openolt_address, "0.0.0.0:50060");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = SimConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, SimConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[olt]\npon_ports = 4\nonus_per_pon = 16\nauth = true\n\n[application]\nlog_level = \"info\""
        )
        .unwrap();

        let config = SimConfig::load_from(file.path()).unwrap();
        assert_eq!(config.olt.pon_ports, 4);
        assert_eq!(config.olt.onus_per_pon, 16);
        assert!(config.olt.auth);
        assert!(!config.olt.dhcp);
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.server.onu_queue_capacity, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = SimConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(SimError::Configuration(_))));

        config.application.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_topology_limits() {
        let mut config = SimConfig::default();
        config.olt.pon_ports = 0;
        assert!(config.validate().is_err());

        config.olt.pon_ports = 256;
        assert!(config.validate().is_err());

        config.olt.pon_ports = 16;
        config.olt.onus_per_pon = 255;
        // 900 + 16 * 255 overflows the VLAN range
        assert!(config.validate().is_err());

        config.olt.c_tag_init = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_address() {
        let mut config = SimConfig::default();
        config.server.api_address = "localhost".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_c_tag_sequence() {
        let config = SimConfig::default();
        assert_eq!(config.c_tag_for(0), 900);
        assert_eq!(config.c_tag_for(5), 905);
    }
}
