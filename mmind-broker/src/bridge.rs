use chrono::Local;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

use crate::{
    config::{BridgeConfig, Qos},
    reading::{Reading, Snapshot},
    UnicastAddr,
};

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Publish to {0} failed")]
    Publish(String),
    #[error("Subscribe to {0} failed")]
    Subscribe(String),
    #[error("Serde Error")]
    Serde(#[from] serde_json::Error),
    #[error("Unrecognized control payload {0:?}")]
    Control(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Disconnected,
    Connecting,
    Connected,
}

/// Publish/subscribe primitives of the external MQTT client. Both calls
/// hand the request to the client and return; delivery is the client's
/// concern.
pub trait PubSubTransport: Send {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos, retain: bool)
        -> Result<(), BridgeError>;
    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), BridgeError>;
}

/// Connectivity and last known values of the bridge channel. Its
/// lifecycle follows the pub/sub client, not mesh provisioning.
#[derive(Debug, Clone)]
pub struct BridgeSession {
    pub connectivity: Connectivity,
    pub latest: Snapshot,
    pub subscriptions: Vec<String>,
    /// Mesh node that receives control commands
    pub target: Option<UnicastAddr>,
}

/// Flat record published to the sensor topic. Channels never received
/// are left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<UnicastAddr>,
    /// Milliseconds since the bridge started
    pub timestamp: u64,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_level: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub light_status: Option<String>,
}

impl BridgeRecord {
    pub fn from_snapshot(device: &str, snap: &Snapshot, timestamp: u64) -> Self {
        Self {
            device: device.to_string(),
            source: snap.source,
            timestamp,
            time: Local::now().to_rfc3339(),
            temperature: snap.temperature,
            humidity: snap.humidity,
            light_level: snap.light_level,
            voltage: snap.voltage,
            light_status: snap.light_status.map(|s| s.as_str().to_string()),
        }
    }
}

/// `'1'` switches the LED on, `'0'` off; leading whitespace is ignored
pub fn parse_control(payload: &[u8]) -> Result<bool, BridgeError> {
    let text = String::from_utf8_lossy(payload);
    match text.trim_start().chars().next() {
        Some('1') => Ok(true),
        Some('0') => Ok(false),
        _ => Err(BridgeError::Control(text.into_owned())),
    }
}

/// Carries mesh readings out to the pub/sub channel and control commands
/// back in. Sole owner of the [`BridgeSession`].
pub struct BridgeAdapter {
    cfg: BridgeConfig,
    transport: Box<dyn PubSubTransport>,
    session: BridgeSession,
    started: Instant,
}

impl BridgeAdapter {
    pub fn new(cfg: BridgeConfig, transport: Box<dyn PubSubTransport>) -> Self {
        Self {
            cfg,
            transport,
            session: BridgeSession {
                connectivity: Connectivity::Disconnected,
                latest: Snapshot::default(),
                subscriptions: vec![],
                target: None,
            },
            started: Instant::now(),
        }
    }

    pub fn session(&self) -> &BridgeSession {
        &self.session
    }

    pub fn connectivity(&self) -> Connectivity {
        self.session.connectivity
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.cfg
    }

    pub fn set_target(&mut self, target: Option<UnicastAddr>) {
        if self.session.target != target {
            log::info!("Bridge control target now {target:04x?}");
        }
        self.session.target = target;
    }

    fn transition(&mut self, to: Connectivity) {
        let from = self.session.connectivity;
        if from != to {
            log::info!("Bridge {from:?} -> {to:?}");
        }
        self.session.connectivity = to;
    }

    pub fn on_connecting(&mut self) {
        self.transition(Connectivity::Connecting);
    }

    pub fn on_disconnected(&mut self) {
        self.transition(Connectivity::Disconnected);
        self.session.subscriptions.clear();
    }

    /// Subscribe the control topic and publish the cached reading once,
    /// if there is one
    pub fn on_connected(&mut self) -> Result<(), BridgeError> {
        self.transition(Connectivity::Connected);

        let topic = self.cfg.control_topic.clone();
        self.transport.subscribe(&topic, self.cfg.qos).map_err(|e| {
            log::error!("Unable to subscribe {topic} {e:}");
            e
        })?;
        if !self.session.subscriptions.contains(&topic) {
            self.session.subscriptions.push(topic);
        }

        if self.session.latest.is_empty() {
            log::debug!("Nothing cached to catch up");
            return Ok(());
        }
        log::info!("Publishing cached reading after connect");
        self.publish_latest()
    }

    /// Cache a reading and publish it when connected. Returns whether a
    /// publish was attempted.
    pub fn on_reading(&mut self, source: UnicastAddr, reading: &Reading) -> Result<bool, BridgeError> {
        self.session.latest.apply(source, reading);
        if self.session.connectivity != Connectivity::Connected {
            log::warn!(
                "Bridge {:?}, publish of reading from 0x{source:04x} suppressed",
                self.session.connectivity
            );
            return Ok(false);
        }
        self.publish_latest()?;
        Ok(true)
    }

    fn publish_latest(&mut self) -> Result<(), BridgeError> {
        let record = BridgeRecord::from_snapshot(
            &self.cfg.device,
            &self.session.latest,
            self.started.elapsed().as_millis() as u64,
        );
        let payload = serde_json::to_vec(&record)?;
        self.transport
            .publish(&self.cfg.sensor_topic, &payload, self.cfg.qos, self.cfg.retain)
            .map_err(|e| {
                log::error!("Publish to {} failed {e:}", self.cfg.sensor_topic);
                e
            })?;
        log::info!(
            "Published {} octets to {}",
            payload.len(),
            self.cfg.sensor_topic
        );
        Ok(())
    }

    /// Turn an inbound control message into `(target, on)`. Commands for
    /// other topics, unparsable payloads and commands arriving before a
    /// target is known are dropped with a warning.
    pub fn on_control(&mut self, topic: &str, payload: &[u8]) -> Option<(UnicastAddr, bool)> {
        if topic != self.cfg.control_topic {
            log::debug!("Ignoring message on {topic}");
            return None;
        }
        let on = parse_control(payload)
            .map_err(|e| {
                log::warn!("Dropping control message {e:}");
                e
            })
            .ok()?;
        let Some(target) = self.session.target else {
            log::warn!("No mesh target known yet, dropping LED command");
            return None;
        };
        log::info!("LED {} requested for 0x{target:04x}", if on { "on" } else { "off" });
        Some((target, on))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{loopback::RecordingPublisher, payload::DhtReading};

    fn dht(t: f32, h: f32) -> Reading {
        Reading::Dht(DhtReading {
            temperature: t,
            humidity: h,
            timestamp: 0,
        })
    }

    #[test]
    fn catch_up_once_on_connect() {
        let publisher = RecordingPublisher::default();
        let mut bridge = BridgeAdapter::new(BridgeConfig::default(), Box::new(publisher.clone()));

        assert!(!bridge.on_reading(0x0005, &dht(21.5, 55.0)).unwrap());
        bridge.on_connecting();
        assert!(publisher.published().is_empty());

        bridge.on_connected().unwrap();
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        let record: BridgeRecord = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(record.temperature, Some(21.5));
        assert_eq!(record.humidity, Some(55.0));
        assert_eq!(record.light_level, None);
        assert_eq!(record.source, Some(0x0005));
        assert_eq!(publisher.subscriptions(), vec![BridgeConfig::default().control_topic]);
    }

    #[test]
    fn unknown_fields_omitted() {
        let record = BridgeRecord::from_snapshot("dev", &Snapshot::default(), 3);
        let text = serde_json::to_string(&record).unwrap();
        assert!(!text.contains("temperature"));
        assert!(!text.contains("source"));
        assert!(text.contains("\"device\":\"dev\""));
    }

    #[test]
    fn nothing_to_catch_up() {
        let publisher = RecordingPublisher::default();
        let mut bridge = BridgeAdapter::new(BridgeConfig::default(), Box::new(publisher.clone()));
        bridge.on_connected().unwrap();
        assert!(publisher.published().is_empty());
        assert!(bridge.on_reading(0x0005, &dht(1.0, 2.0)).unwrap());
        bridge.on_disconnected();
        assert!(!bridge.on_reading(0x0005, &dht(3.0, 4.0)).unwrap());
        assert_eq!(publisher.published().len(), 1);
        assert_eq!(bridge.session().latest.temperature, Some(3.0));
    }

    #[test]
    fn control_needs_target() {
        let mut bridge = BridgeAdapter::new(BridgeConfig::default(), Box::new(RecordingPublisher::default()));
        let topic = bridge.config().control_topic.clone();
        assert_eq!(bridge.on_control(&topic, b"1"), None);

        bridge.set_target(Some(0x0005));
        assert_eq!(bridge.on_control(&topic, b" 1"), Some((0x0005, true)));
        assert_eq!(bridge.on_control(&topic, b"0"), Some((0x0005, false)));
        assert_eq!(bridge.on_control(&topic, b"on"), None);
        assert_eq!(bridge.on_control(&topic, b""), None);
        assert_eq!(bridge.on_control("other/topic", b"1"), None);
    }
}
