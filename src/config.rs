use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::messages::MessageVersion;

/// Reliable messaging timing, copied into every exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RmpConfig {
    /// Retransmit timeout used until something was received from the peer.
    pub initial_retrans_timeout_ms: u32,
    /// Retransmit timeout once the peer proved to be awake.
    pub active_retrans_timeout_ms: u32,
    /// How long an ack may wait for a piggyback opportunity.
    pub ack_piggyback_timeout_ms: u32,
    pub max_retrans: u8,
}

impl Default for RmpConfig {
    fn default() -> Self {
        Self {
            initial_retrans_timeout_ms: 5000,
            active_retrans_timeout_ms: 300,
            ack_piggyback_timeout_ms: 200,
            max_retrans: 4,
        }
    }
}

impl RmpConfig {
    pub fn initial_retrans_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_retrans_timeout_ms as u64)
    }
    pub fn active_retrans_timeout(&self) -> Duration {
        Duration::from_millis(self.active_retrans_timeout_ms as u64)
    }
    pub fn ack_piggyback_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_piggyback_timeout_ms as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub local_node_id: u64,
    pub listen_address: String,
    /// Size of the exchange context pool.
    pub max_contexts: usize,
    pub retrans_table_size: usize,
    /// Length of one reliable messaging tick.
    pub timer_interval_ms: u32,
    /// Default response timeout of new exchanges, 0 disables the timer.
    pub response_timeout_ms: u32,
    pub auto_request_ack: bool,
    pub message_version: MessageVersion,
    /// Remembered message ids per peer for duplicate detection.
    pub max_cached_counters: usize,
    /// Return InvalidAckId from message handling instead of only logging it.
    pub surface_invalid_ack_id: bool,
    pub rmp: RmpConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            local_node_id: 1,
            listen_address: "0.0.0.0:11095".to_owned(),
            max_contexts: 16,
            retrans_table_size: 16,
            timer_interval_ms: 64,
            response_timeout_ms: 0,
            auto_request_ack: true,
            message_version: MessageVersion::V2,
            max_cached_counters: 32,
            surface_invalid_ack_id: false,
            rmp: RmpConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms.max(1) as u64)
    }
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms as u64)
    }
}

pub fn load_config(path: &str) -> Result<ManagerConfig> {
    let data = std::fs::read_to_string(path).context(format!("reading config from {}", path))?;
    serde_json::from_str(&data).context(format!("parsing {}", path))
}

pub fn save_config(path: &str, config: &ManagerConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).context(format!("writing config to {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let c: ManagerConfig =
            serde_json::from_str(r#"{"local_node_id": 77, "rmp": {"max_retrans": 2}}"#).unwrap();
        assert_eq!(c.local_node_id, 77);
        assert_eq!(c.rmp.max_retrans, 2);
        assert_eq!(c.rmp.active_retrans_timeout_ms, 300);
        assert_eq!(c.max_contexts, 16);
        assert_eq!(c.message_version, MessageVersion::V2);
    }

    #[test]
    fn save_and_load() {
        let path = std::env::temp_dir().join(format!("matx-config-{}.json", std::process::id()));
        let path = path.to_string_lossy().to_string();
        let c = ManagerConfig {
            local_node_id: 300,
            timer_interval_ms: 10,
            ..Default::default()
        };
        save_config(&path, &c).unwrap();
        let l = load_config(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(l, c);
        assert!(load_config(&path).is_err());
    }
}
