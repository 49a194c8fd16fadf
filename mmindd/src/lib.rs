//! Daemon for the mesh-minder system: runs a provisioner with its MQTT
//! bridge plus a set of sensor servers over the in-process loopback mesh,
//! logging everything the nodes and the bridge do.

pub mod deployment;

use mmind_broker::{
    config::{BridgeConfig, NodeConfig},
    NodeError, UuidMatch,
};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshMinderError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Node Error")]
    Node(#[from] NodeError),
    #[error("Config Error")]
    Config(#[from] serde_json::Error),
    #[error("Mailbox Error")]
    Mailbox(#[from] actix::MailboxError),
    #[error("Logging setup failed: {0}")]
    Logging(String),
}

pub type MeshMinderResult<T> = std::result::Result<T, MeshMinderError>;

/// Environment variable naming a JSON file with [`DaemonConfig`] overrides
pub const CONFIG_ENV: &str = "MMIND_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub log_dir: String,
    pub log_level: String,
    pub state_path: String,
    pub provisioner: NodeConfig,
    pub servers: Vec<NodeConfig>,
    pub bridge: BridgeConfig,
    /// Delay before the simulated MQTT client reports connected
    pub connect_delay_ms: u64,
    pub probe_interval_ms: u64,
    pub status_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let mut provisioner = NodeConfig::provisioner();
        // every server image carries its own UUID prefix, take them all
        provisioner.uuid_match = UuidMatch {
            prefix: vec![],
            offset: 0,
        };
        Self {
            log_dir: "./logs".to_string(),
            log_level: "debug".to_string(),
            state_path: "./mmindd-state.json".to_string(),
            provisioner,
            servers: vec![
                NodeConfig::dht_server(),
                NodeConfig::ldr_server(),
                NodeConfig::sensor_server(),
            ],
            bridge: BridgeConfig::default(),
            connect_delay_ms: 2_000,
            probe_interval_ms: 10_000,
            status_interval_ms: 30_000,
        }
    }
}

impl DaemonConfig {
    /// Defaults, overridden by the file named in `MMIND_CONFIG` if set
    pub fn load() -> MeshMinderResult<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> MeshMinderResult<Self> {
        let raw = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::DEBUG)
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmind_broker::{Role, RetryPolicy};

    #[test]
    fn partial_overrides_keep_defaults() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{
                "log_level": "info",
                "servers": [{ "role": "ldr_server", "publish_interval_ms": 1000 }],
                "provisioner": { "retry": { "kind": "unbounded" } }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.level(), tracing::Level::INFO);
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].role, Role::LdrServer);
        assert_eq!(cfg.servers[0].publish_interval_ms, 1000);
        assert_eq!(cfg.provisioner.retry, RetryPolicy::Unbounded);
        assert_eq!(cfg.bridge.sensor_topic, BridgeConfig::default().sensor_topic);
    }

    #[test]
    fn default_provisioner_accepts_every_server() {
        let cfg = DaemonConfig::default();
        let roles: Vec<_> = cfg.servers.iter().map(|s| s.role).collect();
        assert_eq!(
            roles,
            vec![Role::DhtServer, Role::LdrServer, Role::SensorServer]
        );
        assert!(cfg
            .servers
            .iter()
            .all(|s| cfg.provisioner.uuid_match.matches(&s.uuid)));
    }

    #[test]
    fn bad_level_falls_back_to_debug() {
        let cfg = DaemonConfig {
            log_level: "loud".to_string(),
            ..DaemonConfig::default()
        };
        assert_eq!(cfg.level(), tracing::Level::DEBUG);
    }
}
