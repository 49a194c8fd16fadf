//! Deployment constants and the per-node / bridge configuration built
//! from them. Every struct here deserializes with `#[serde(default)]`,
//! so an override file only needs to name the fields it changes.
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::{AppKey, CompanyId, DeviceUuid, KeyIndex, UnicastAddr};

/// Espressif company identifier, used for the vendor models
pub const CID_ESP: CompanyId = 0x02E5;

/// Address the provisioner assigns itself
pub const PROV_OWN_ADDR: UnicastAddr = 0x0001;
/// First address handed out to provisioned devices
pub const PROV_START_ADDR: UnicastAddr = 0x0005;

pub const NET_IDX_PRIMARY: KeyIndex = 0x0000;
pub const APP_KEY_IDX: KeyIndex = 0x0000;
pub const APP_KEY_OCTET: u8 = 0x12;

pub const MSG_SEND_TTL: u8 = 3;

pub const DHT_PUBLISH_INTERVAL_MS: u64 = 5_000;
pub const LDR_PUBLISH_INTERVAL_MS: u64 = 3_000;
pub const SENSOR_SAMPLE_INTERVAL_MS: u64 = 2_000;
pub const REQUEST_TIMEOUT_MS: u64 = 4_000;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// UUID prefixes burned into each node image
pub const UUID_PREFIX_PROVISIONER: [u8; 2] = [0x32, 0x10];
pub const UUID_PREFIX_DHT: [u8; 2] = [0x32, 0x10];
pub const UUID_PREFIX_LDR: [u8; 2] = [0x33, 0x11];
pub const UUID_PREFIX_SENSOR: [u8; 2] = [0xdd, 0xdd];

pub const MQTT_BROKER_URL: &str = "mqtt://broker.emqx.io:1883";
pub const MQTT_SENSOR_TOPIC: &str = "22004015/tranvancon";
pub const MQTT_CONTROL_TOPIC: &str = "22004015/tranvancon/led";
pub const BRIDGE_DEVICE_NAME: &str = "ESP32_BLE_Mesh_Client";

/// Build a device UUID from its two octet prefix, the remaining octets
/// carry a per-device serial
pub fn device_uuid(prefix: [u8; 2], serial: u16) -> DeviceUuid {
    let mut uuid = [0u8; 16];
    uuid[..2].copy_from_slice(&prefix);
    uuid[14..].copy_from_slice(&serial.to_be_bytes());
    uuid
}

/// What a node image does once provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Provisions and configures servers, collects their readings and
    /// feeds the bridge
    Provisioner,
    /// Vendor server publishing temperature and humidity
    DhtServer,
    /// Vendor server publishing light level
    LdrServer,
    /// SIG sensor server answering Sensor Get / Descriptor Get
    SensorServer,
}

/// Retry behaviour of the client tracker on response timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Re-issue at most `max_retries` times, then abandon
    Bounded { max_retries: u32 },
    /// Re-issue forever. Only for deployments that accept a node hanging
    /// on an unreachable peer.
    Unbounded,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Bounded {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn allows(&self, retries_so_far: u32) -> bool {
        match self {
            RetryPolicy::Bounded { max_retries } => retries_so_far < *max_retries,
            RetryPolicy::Unbounded => true,
        }
    }
}

/// Provisioner side filter for unprovisioned device beacons
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidMatch {
    pub prefix: Vec<u8>,
    pub offset: usize,
}

impl Default for UuidMatch {
    fn default() -> Self {
        Self {
            prefix: UUID_PREFIX_PROVISIONER.to_vec(),
            offset: 0,
        }
    }
}

impl UuidMatch {
    pub fn matches(&self, uuid: &DeviceUuid) -> bool {
        self.offset
            .checked_add(self.prefix.len())
            .and_then(|end| uuid.get(self.offset..end))
            .map(|window| window == self.prefix.as_slice())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub role: Role,
    pub uuid: DeviceUuid,
    pub company_id: CompanyId,
    pub net_idx: KeyIndex,
    pub app_idx: KeyIndex,
    pub app_key: AppKey,
    pub ttl: u8,
    /// Provisioner only: which beacons to accept
    pub uuid_match: UuidMatch,
    /// Provisioner only: own unicast address
    pub own_addr: UnicastAddr,
    /// Servers: unicast peer receiving periodic publishes
    pub publish_peer: Option<UnicastAddr>,
    /// Servers: also publish to the all-nodes address
    pub publish_broadcast: bool,
    pub publish_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::provisioner()
    }
}

impl NodeConfig {
    fn base(name: &str, role: Role, uuid: DeviceUuid) -> Self {
        Self {
            name: name.to_string(),
            role,
            uuid,
            company_id: CID_ESP,
            net_idx: NET_IDX_PRIMARY,
            app_idx: APP_KEY_IDX,
            app_key: [APP_KEY_OCTET; 16],
            ttl: MSG_SEND_TTL,
            uuid_match: UuidMatch::default(),
            own_addr: PROV_OWN_ADDR,
            publish_peer: Some(PROV_OWN_ADDR),
            publish_broadcast: true,
            publish_interval_ms: DHT_PUBLISH_INTERVAL_MS,
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            retry: RetryPolicy::default(),
        }
    }

    pub fn provisioner() -> Self {
        let mut cfg = Self::base(
            "provisioner",
            Role::Provisioner,
            device_uuid(UUID_PREFIX_PROVISIONER, 0x0001),
        );
        cfg.publish_peer = None;
        cfg.publish_broadcast = false;
        cfg
    }

    pub fn dht_server() -> Self {
        Self::base("dht-server", Role::DhtServer, device_uuid(UUID_PREFIX_DHT, 0x0002))
    }

    pub fn ldr_server() -> Self {
        let mut cfg = Self::base("ldr-server", Role::LdrServer, device_uuid(UUID_PREFIX_LDR, 0x0003));
        cfg.publish_interval_ms = LDR_PUBLISH_INTERVAL_MS;
        cfg
    }

    pub fn sensor_server() -> Self {
        let mut cfg = Self::base(
            "sensor-server",
            Role::SensorServer,
            device_uuid(UUID_PREFIX_SENSOR, 0x0004),
        );
        cfg.publish_peer = None;
        cfg.publish_broadcast = false;
        cfg.publish_interval_ms = SENSOR_SAMPLE_INTERVAL_MS;
        cfg
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
}

/// Delivery guarantee requested from the pub/sub transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub device: String,
    pub broker_url: String,
    pub sensor_topic: String,
    pub control_topic: String,
    pub qos: Qos,
    pub retain: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: BRIDGE_DEVICE_NAME.to_string(),
            broker_url: MQTT_BROKER_URL.to_string(),
            sensor_topic: MQTT_SENSOR_TOPIC.to_string(),
            control_topic: MQTT_CONTROL_TOPIC.to_string(),
            qos: Qos::AtLeastOnce,
            retain: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_match_on_prefix() {
        let m = UuidMatch::default();
        assert!(m.matches(&device_uuid(UUID_PREFIX_DHT, 9)));
        assert!(!m.matches(&device_uuid(UUID_PREFIX_LDR, 9)));

        let ldr = UuidMatch {
            prefix: UUID_PREFIX_LDR.to_vec(),
            offset: 0,
        };
        assert!(ldr.matches(&device_uuid(UUID_PREFIX_LDR, 1)));
    }

    #[test]
    fn uuid_match_out_of_range_offset() {
        let m = UuidMatch {
            prefix: vec![0x00, 0x00],
            offset: 15,
        };
        assert!(!m.matches(&[0u8; 16]));
    }

    #[test]
    fn retry_policy_bounds() {
        let bounded = RetryPolicy::Bounded { max_retries: 2 };
        assert!(bounded.allows(0));
        assert!(bounded.allows(1));
        assert!(!bounded.allows(2));
        assert!(RetryPolicy::Unbounded.allows(u32::MAX));
    }

    #[test]
    fn partial_override_keeps_defaults() {
        let cfg: NodeConfig =
            serde_json::from_str(r#"{"role":"ldr_server","retry":{"kind":"unbounded"}}"#)
                .expect("parse");
        assert_eq!(cfg.role, Role::LdrServer);
        assert_eq!(cfg.retry, RetryPolicy::Unbounded);
        assert_eq!(cfg.company_id, CID_ESP);
        assert_eq!(cfg.ttl, MSG_SEND_TTL);
    }
}
