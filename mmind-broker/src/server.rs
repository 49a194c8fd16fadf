use mmind_sensor::{Actuator, ActuatorId, Quantity, Sampler, SensorError};
use std::{collections::HashSet, time::Instant};
use thiserror::Error;

use crate::{
    config::{NodeConfig, Role},
    opcode::{sig, Opcode, VendorOp},
    payload::{self, DhtReading, LdrReading, LedControl, PayloadError, TypedPayload, VendorTid},
    reading::Snapshot,
    sensor_data::{
        self, PropertyId, SensorDataError, SensorDescriptor, SensorEntry, SensorValue,
        PRESENT_AMBIENT_LIGHT_LEVEL, PRESENT_AMBIENT_RELATIVE_HUMIDITY,
        PRESENT_INDOOR_AMBIENT_TEMPERATURE,
    },
    transport::{AccessKey, InboundMessage, MessageCtx, OutboundMessage},
    CompanyId, KeyIndex, ModelBinding, ModelKey, UnicastAddr, ADDR_ALL_NODES, ADDR_UNASSIGNED,
};

/// Reported until the first sample lands (Temperature 8 raw 40)
const SEED_TEMPERATURE: f32 = 20.0;
const SEED_HUMIDITY: f32 = 60.0;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Payload Error")]
    Payload(#[from] PayloadError),
    #[error("Sensor data Error")]
    SensorData(#[from] SensorDataError),
    #[error("Sensor Error")]
    Sensor(#[from] SensorError),
    #[error("No application key to reply with")]
    NoAppKey,
}

/// Server side of a node: answers requests addressed to its bound models
/// and publishes periodic samples.
///
/// Replies are always built here from the cached readings (explicit
/// response mode); the mesh stack never answers a GET on our behalf.
pub struct ServerEngine {
    company: CompanyId,
    role: Role,
    ttl: u8,
    unicast: UnicastAddr,
    net_idx: Option<KeyIndex>,
    app_idx: Option<KeyIndex>,
    bound: HashSet<ModelKey>,
    peer: Option<UnicastAddr>,
    broadcast: bool,
    samplers: Vec<Box<dyn Sampler>>,
    actuator: Option<Box<dyn Actuator>>,
    cache: Snapshot,
    seeded: bool,
    started: Instant,
}

impl ServerEngine {
    pub fn new(
        cfg: &NodeConfig,
        samplers: Vec<Box<dyn Sampler>>,
        actuator: Option<Box<dyn Actuator>>,
    ) -> Self {
        Self {
            company: cfg.company_id,
            role: cfg.role,
            ttl: cfg.ttl,
            unicast: ADDR_UNASSIGNED,
            net_idx: None,
            app_idx: None,
            bound: HashSet::new(),
            peer: cfg.publish_peer,
            broadcast: cfg.publish_broadcast,
            samplers,
            actuator,
            cache: Snapshot::default(),
            seeded: false,
            started: Instant::now(),
        }
    }

    /// Models this node serves
    pub fn served_models(&self) -> Vec<ModelKey> {
        let vendor = ModelKey::vendor(self.company, ModelKey::VND_SERVER_ID);
        match self.role {
            Role::Provisioner => vec![],
            Role::DhtServer | Role::LdrServer => vec![vendor],
            Role::SensorServer => vec![
                ModelKey::SENSOR_SERVER,
                ModelKey::SENSOR_SETUP_SERVER,
                vendor,
            ],
        }
    }

    pub fn is_ready(&self) -> bool {
        self.unicast != ADDR_UNASSIGNED && self.net_idx.is_some()
    }

    pub fn is_bound(&self, model: &ModelKey) -> bool {
        self.bound.contains(model)
    }

    pub fn cache(&self) -> &Snapshot {
        &self.cache
    }

    /// Unlocks publishing. The reading buffer is seeded only the first
    /// time the node becomes ready.
    pub fn on_ready(&mut self, unicast: UnicastAddr, net_idx: KeyIndex) {
        self.unicast = unicast;
        self.net_idx = Some(net_idx);
        if !self.seeded {
            self.cache.temperature = Some(SEED_TEMPERATURE);
            self.cache.humidity = Some(SEED_HUMIDITY);
            self.cache.source = Some(unicast);
            self.seeded = true;
            log::info!("Seeded reading buffer {:?}", self.cache);
        }
    }

    pub fn on_app_key(&mut self, app_idx: KeyIndex) {
        self.app_idx = Some(app_idx);
    }

    pub fn on_bound(&mut self, binding: ModelBinding) {
        if binding.element != self.unicast {
            log::warn!(
                "Bind for element 0x{:04x} is not ours (0x{:04x})",
                binding.element,
                self.unicast
            );
            return;
        }
        if self.served_models().contains(&binding.model) {
            self.bound.insert(binding.model);
        }
    }

    pub fn on_teardown(&mut self) {
        self.unicast = ADDR_UNASSIGNED;
        self.net_idx = None;
        self.app_idx = None;
        self.bound.clear();
        self.cache = Snapshot::default();
        self.seeded = false;
        log::info!("Server engine torn down");
    }

    fn uptime_ms(&self) -> u32 {
        payload::uptime_ms(self.started.elapsed())
    }

    fn sample_all(&mut self) {
        for s in self.samplers.iter_mut() {
            let q = s.quantity();
            match s.sample() {
                Ok(v) => match q {
                    Quantity::Temperature => self.cache.temperature = Some(v),
                    Quantity::Humidity => self.cache.humidity = Some(v),
                    Quantity::Light => self.cache.light_level = Some(v),
                },
                Err(e) => log::error!("Sampling {q:?} failed {e:}"),
            }
        }
        self.cache.source = Some(self.unicast);
    }

    fn message(
        &self,
        dst: UnicastAddr,
        sender: ModelKey,
        opcode: Opcode,
        payload: Vec<u8>,
    ) -> Result<OutboundMessage, ServerError> {
        let (Some(net_idx), Some(app_idx)) = (self.net_idx, self.app_idx) else {
            return Err(ServerError::NoAppKey);
        };
        Ok(OutboundMessage {
            ctx: MessageCtx {
                net_idx,
                key: AccessKey::App(app_idx),
                dst,
                ttl: self.ttl,
            },
            sender,
            opcode,
            payload,
        })
    }

    /// Periodic timer body: refresh the cache and, for publishing roles,
    /// build one message per destination. Destinations are independent
    /// messages so a failed send to one does not affect the other.
    pub fn publish_tick(&mut self) -> Result<Vec<OutboundMessage>, ServerError> {
        if !self.is_ready() {
            log::trace!("Not provisioned, skipping publish");
            return Ok(vec![]);
        }
        self.sample_all();

        let ts = self.uptime_ms();
        let (opcode, payload) = match self.role {
            Role::DhtServer => {
                let (Some(temperature), Some(humidity)) = (self.cache.temperature, self.cache.humidity)
                else {
                    log::warn!("No temperature/humidity sample, skipping publish");
                    return Ok(vec![]);
                };
                let r = DhtReading {
                    temperature,
                    humidity,
                    timestamp: ts,
                };
                log::info!("Publishing DHT {:.2}C {:.2}%", r.temperature, r.humidity);
                (VendorOp::DhtData.opcode(self.company), r.encode())
            }
            Role::LdrServer => {
                let Some(level) = self.cache.light_level else {
                    log::warn!("No light sample, skipping publish");
                    return Ok(vec![]);
                };
                let r = LdrReading::from_level(level.max(0.0) as u16, ts);
                self.cache.voltage = Some(r.voltage);
                self.cache.light_status = Some(r.light_status);
                log::info!(
                    "Publishing LDR level {} ({:.2}V, {})",
                    r.light_level,
                    r.voltage,
                    r.light_status.as_str()
                );
                (VendorOp::LdrData.opcode(self.company), r.encode())
            }
            Role::Provisioner | Role::SensorServer => return Ok(vec![]),
        };

        let sender = ModelKey::vendor(self.company, ModelKey::VND_SERVER_ID);
        if !self.is_bound(&sender) {
            log::debug!("Vendor server not bound yet, skipping publish");
            return Ok(vec![]);
        }

        let mut destinations = vec![];
        if let Some(peer) = self.peer.filter(|p| *p != ADDR_UNASSIGNED && *p != self.unicast) {
            destinations.push(peer);
        }
        if self.broadcast {
            destinations.push(ADDR_ALL_NODES);
        }
        destinations
            .into_iter()
            .map(|dst| self.message(dst, sender, opcode, payload.clone()))
            .collect()
    }

    /// Handle a request routed to one of our server models. Requests to
    /// unbound models are ignored.
    pub fn handle_request(
        &mut self,
        model: ModelKey,
        msg: &InboundMessage,
    ) -> Result<Vec<OutboundMessage>, ServerError> {
        if !self.is_ready() {
            log::warn!("Request {} before provisioning, ignoring", msg.opcode);
            return Ok(vec![]);
        }
        if !self.is_bound(&model) {
            log::warn!(
                "Request {} from 0x{:04x} to unbound model {model:?}, ignoring",
                msg.opcode,
                msg.src
            );
            return Ok(vec![]);
        }

        if let Some(op) = VendorOp::from_opcode(msg.opcode, self.company) {
            return self.handle_vendor(model, op, msg);
        }
        self.handle_sensor(model, msg)
    }

    fn handle_vendor(
        &mut self,
        model: ModelKey,
        op: VendorOp,
        msg: &InboundMessage,
    ) -> Result<Vec<OutboundMessage>, ServerError> {
        match op {
            VendorOp::Send => {
                let tid = VendorTid::decode(&msg.payload)?;
                log::info!("Probe 0x{:04x} from 0x{:04x}, echoing", tid.0, msg.src);
                Ok(vec![self.message(
                    msg.src,
                    model,
                    VendorOp::Status.opcode(self.company),
                    tid.encode(),
                )?])
            }
            VendorOp::LedCtrl => {
                let ctrl = LedControl::decode(&msg.payload)?;
                match self.actuator.as_mut() {
                    Some(a) => a.set(ActuatorId::Led, ctrl.on)?,
                    None => log::warn!("No LED on this node, ignoring control"),
                }
                Ok(vec![])
            }
            other => {
                log::warn!("Unexpected vendor request {other:?} from 0x{:04x}", msg.src);
                Ok(vec![])
            }
        }
    }

    fn supported_properties(&self) -> Vec<PropertyId> {
        self.samplers
            .iter()
            .map(|s| match s.quantity() {
                Quantity::Temperature => PRESENT_INDOOR_AMBIENT_TEMPERATURE,
                Quantity::Humidity => PRESENT_AMBIENT_RELATIVE_HUMIDITY,
                Quantity::Light => PRESENT_AMBIENT_LIGHT_LEVEL,
            })
            .collect()
    }

    fn handle_sensor(
        &mut self,
        model: ModelKey,
        msg: &InboundMessage,
    ) -> Result<Vec<OutboundMessage>, ServerError> {
        let Some(resp) = msg.opcode.response() else {
            log::warn!("Unexpected sensor request {}", msg.opcode);
            return Ok(vec![]);
        };
        let supported = self.supported_properties();

        let body = match msg.opcode {
            sig::SENSOR_GET => {
                let entries: Vec<SensorEntry> = match optional_property(&msg.payload)? {
                    Some(p) if supported.contains(&p) => {
                        vec![sensor_data::encode_value(p, self.cached(p))]
                    }
                    Some(p) => vec![SensorEntry {
                        property: p,
                        raw: vec![],
                    }],
                    None => supported
                        .iter()
                        .map(|&p| sensor_data::encode_value(p, self.cached(p)))
                        .collect(),
                };
                sensor_data::encode(&entries)?
            }
            sig::SENSOR_DESCRIPTOR_GET => {
                let props = match optional_property(&msg.payload)? {
                    Some(p) if !supported.contains(&p) => {
                        log::debug!("Descriptor for unsupported property 0x{p:04x}");
                        return Ok(vec![self.message(msg.src, model, resp, p.to_le_bytes().to_vec())?]);
                    }
                    Some(p) => vec![p],
                    None => supported,
                };
                let mut buf = vec![];
                props
                    .into_iter()
                    .for_each(|p| SensorDescriptor::unspecified(p).write(&mut buf));
                buf
            }
            // cadence, settings, column and series are not supported: the
            // status carries only the property id
            _ => {
                let p = msg.payload.get(..2).ok_or(PayloadError::Truncated)?;
                p.to_vec()
            }
        };

        log::info!("Replying {resp} to 0x{:04x} ({} octets)", msg.src, body.len());
        Ok(vec![self.message(msg.src, model, resp, body)?])
    }

    fn cached(&self, property: PropertyId) -> Option<SensorValue> {
        self.cache.value_for(property)
    }
}

/// A GET body is empty or a single property id
fn optional_property(payload: &[u8]) -> Result<Option<PropertyId>, PayloadError> {
    match payload.len() {
        0 => Ok(None),
        2 => Ok(Some(u16::from_le_bytes([payload[0], payload[1]]))),
        got => Err(PayloadError::Length { expected: 2, got }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CID_ESP, PROV_OWN_ADDR};
    use mmind_sensor::{FixedSampler, SimulatedLed};

    const ME: UnicastAddr = 0x0005;

    fn vendor_server() -> ModelKey {
        ModelKey::vendor(CID_ESP, ModelKey::VND_SERVER_ID)
    }

    fn ready(mut engine: ServerEngine) -> ServerEngine {
        engine.on_ready(ME, 0);
        engine.on_app_key(0);
        for model in engine.served_models() {
            engine.on_bound(ModelBinding { model, element: ME });
        }
        engine
    }

    fn dht_engine() -> ServerEngine {
        ServerEngine::new(
            &NodeConfig::dht_server(),
            vec![
                Box::new(FixedSampler {
                    quantity: Quantity::Temperature,
                    value: 21.5,
                }),
                Box::new(FixedSampler {
                    quantity: Quantity::Humidity,
                    value: 55.0,
                }),
            ],
            None,
        )
    }

    fn req(opcode: Opcode, payload: Vec<u8>) -> InboundMessage {
        InboundMessage {
            src: PROV_OWN_ADDR,
            dst: ME,
            opcode,
            payload,
        }
    }

    #[test]
    fn echo_keeps_tid() {
        let mut s = ready(dht_engine());
        let out = s
            .handle_request(
                vendor_server(),
                &req(VendorOp::Send.opcode(CID_ESP), VendorTid(0x0007).encode()),
            )
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode, VendorOp::Status.opcode(CID_ESP));
        assert_eq!(out[0].ctx.dst, PROV_OWN_ADDR);
        assert_eq!(VendorTid::decode(&out[0].payload), Ok(VendorTid(0x0007)));
    }

    #[test]
    fn unbound_model_ignored() {
        let mut s = dht_engine();
        s.on_ready(ME, 0);
        s.on_app_key(0);
        let out = s
            .handle_request(
                vendor_server(),
                &req(VendorOp::Send.opcode(CID_ESP), VendorTid(1).encode()),
            )
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn led_control_length_guard() {
        let led = SimulatedLed::new();
        let handle = led.handle();
        let mut s = ready(ServerEngine::new(
            &NodeConfig::dht_server(),
            vec![],
            Some(Box::new(led)),
        ));
        let op = VendorOp::LedCtrl.opcode(CID_ESP);
        let good = LedControl {
            on: true,
            timestamp: 0,
        }
        .encode();

        for len in 0..=255usize {
            if len == LedControl::WIRE_LEN {
                continue;
            }
            let payload: Vec<u8> = (0..len).map(|i| *good.get(i).unwrap_or(&1)).collect();
            assert!(s.handle_request(vendor_server(), &req(op, payload)).is_err());
            assert!(!handle.is_on());
        }

        s.handle_request(vendor_server(), &req(op, good)).unwrap();
        assert!(handle.is_on());
    }

    #[test]
    fn publishes_to_peer_and_broadcast() {
        let mut s = ready(dht_engine());
        let out = s.publish_tick().unwrap();
        let dsts: Vec<_> = out.iter().map(|m| m.ctx.dst).collect();
        assert_eq!(dsts, vec![PROV_OWN_ADDR, ADDR_ALL_NODES]);
        assert_eq!(out[0].payload, out[1].payload);
        let r = DhtReading::decode(&out[0].payload).unwrap();
        assert_eq!(r.temperature, 21.5);
        assert_eq!(out[0].ctx.ttl, out[1].ctx.ttl);
    }

    #[test]
    fn no_publish_before_ready_or_after_teardown() {
        let mut s = dht_engine();
        assert!(s.publish_tick().unwrap().is_empty());
        let mut s = ready(s);
        assert_eq!(s.publish_tick().unwrap().len(), 2);
        s.on_teardown();
        assert!(s.publish_tick().unwrap().is_empty());
        assert!(s.cache().is_empty());
    }

    #[test]
    fn sensor_get_uses_cache() {
        let mut s = ready(ServerEngine::new(
            &NodeConfig::sensor_server(),
            vec![
                Box::new(FixedSampler {
                    quantity: Quantity::Temperature,
                    value: 20.0,
                }),
                Box::new(FixedSampler {
                    quantity: Quantity::Humidity,
                    value: 60.0,
                }),
            ],
            None,
        ));
        let out = s
            .handle_request(ModelKey::SENSOR_SERVER, &req(sig::SENSOR_GET, vec![]))
            .unwrap();
        assert_eq!(out[0].opcode, sig::SENSOR_STATUS);
        let values = sensor_data::decode_status(&out[0].payload).unwrap();
        assert_eq!(
            values,
            vec![
                (PRESENT_INDOOR_AMBIENT_TEMPERATURE, SensorValue::Temperature(20.0)),
                (PRESENT_AMBIENT_RELATIVE_HUMIDITY, SensorValue::Humidity(60.0)),
            ]
        );

        // unsupported property answered with a zero length entry
        let out = s
            .handle_request(
                ModelKey::SENSOR_SERVER,
                &req(sig::SENSOR_GET, PRESENT_AMBIENT_LIGHT_LEVEL.to_le_bytes().to_vec()),
            )
            .unwrap();
        let entries = sensor_data::parse(&out[0].payload).unwrap();
        assert_eq!(entries[0].property, PRESENT_AMBIENT_LIGHT_LEVEL);
        assert!(entries[0].raw.is_empty());

        let out = s
            .handle_request(ModelKey::SENSOR_SERVER, &req(sig::SENSOR_DESCRIPTOR_GET, vec![]))
            .unwrap();
        assert_eq!(sensor_data::parse_descriptors(&out[0].payload).unwrap().len(), 2);
    }
}
