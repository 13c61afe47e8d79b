// Pipeline options and their on-disk form

use crate::error::SnifferError;
use crate::history::DEFAULT_HISTORY_LEN;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Options accepted by the pipeline at construction.
///
/// Every field has a default so a partial JSON file is enough.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Options {
    /// Capture filter expression, e.g. "tcp and port 80"
    pub bpf_filter: String,

    /// Refresh interval in seconds
    pub interval_secs: u64,

    /// Interface name prefixes to monitor (empty = all)
    pub devices_prefix: Vec<String>,

    /// Only attribute sockets owned by these PIDs (empty = all)
    pub pids: Vec<i32>,

    /// Skip reverse DNS entirely
    pub disable_dns_resolve: bool,

    pub dns_cache_capacity: usize,
    pub dns_ttl_secs: u64,
    /// Upper bound on concurrent reverse lookups
    pub dns_workers: usize,
    pub dns_timeout_ms: u64,

    /// Number of past intervals kept for rate smoothing
    pub history_len: usize,

    /// Count frames that can't be decoded as unattributed traffic instead of
    /// dropping them
    pub count_undecodable: bool,

    pub promiscuous: bool,

    /// Preferred socket mapper backend ("procfs", "lsof")
    pub socket_mapper: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            bpf_filter: "tcp or udp".to_string(),
            interval_secs: 1,
            devices_prefix: Vec::new(),
            pids: Vec::new(),
            disable_dns_resolve: false,
            dns_cache_capacity: 1024,
            dns_ttl_secs: 300,
            dns_workers: 4,
            dns_timeout_ms: 3000,
            history_len: DEFAULT_HISTORY_LEN,
            count_undecodable: true,
            promiscuous: false,
            socket_mapper: None,
        }
    }
}

impl Options {
    /// Load options from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).context(format!("Failed to read options file: {:?}", path))?;

        let options: Options =
            serde_json::from_str(&contents).context("Failed to parse options file")?;

        log::info!("Loaded options from {:?}", path);
        Ok(options)
    }

    /// Save options to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize options")?;
        fs::write(path, contents).context(format!("Failed to write options file: {:?}", path))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SnifferError> {
        if self.interval_secs == 0 {
            return Err(SnifferError::InvalidOptions(
                "refresh interval must be greater than zero".to_string(),
            ));
        }
        if self.history_len == 0 {
            return Err(SnifferError::InvalidOptions(
                "history length must be greater than zero".to_string(),
            ));
        }
        if !self.disable_dns_resolve {
            if self.dns_cache_capacity == 0 {
                return Err(SnifferError::InvalidOptions(
                    "DNS cache capacity must be greater than zero".to_string(),
                ));
            }
            if self.dns_workers == 0 {
                return Err(SnifferError::InvalidOptions(
                    "DNS worker count must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn dns_ttl(&self) -> Duration {
        Duration::from_secs(self.dns_ttl_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }
}
