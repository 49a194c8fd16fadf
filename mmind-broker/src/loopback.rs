//! In-process collaborators: a loopback mesh that stands in for the
//! radio and the stack's configuration server, a log-only pub/sub
//! transport, and recording doubles for tests.
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{
    bridge::{BridgeError, PubSubTransport},
    composition::CompositionData,
    config::Qos,
    config_msg::{
        AppKeyAdd, ModelAppBind, STATUS_INVALID_MODEL, STATUS_INVALID_NETKEY_INDEX, STATUS_SUCCESS,
    },
    node::MeshEvent,
    opcode::{sig, Opcode},
    provisioning::{Bearer, ProvEvent},
    transport::{InboundMessage, MeshTransport, OutboundMessage, TransportError},
    AppKey, DeviceUuid, KeyIndex, ModelBinding, UnicastAddr, ADDR_ALL_NODES, ADDR_UNASSIGNED,
};

/// First address handed out to provisioned devices
pub const LOOPBACK_START_ADDR: UnicastAddr = crate::config::PROV_START_ADDR;

struct Attached {
    uuid: DeviceUuid,
    composition: CompositionData,
    events: UnboundedSender<MeshEvent>,
    unicast: UnicastAddr,
    net_idx: Option<KeyIndex>,
    advertising: bool,
    bound: HashSet<ModelBinding>,
}

impl Attached {
    fn owns(&self, addr: UnicastAddr) -> bool {
        self.unicast != ADDR_UNASSIGNED
            && addr >= self.unicast
            && addr < self.unicast.saturating_add(self.composition.element_count() as u16)
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Node 0x{:04x} stopped listening", self.unicast);
        }
    }

    /// Provisioners scan once they have an address and provisioning on
    fn is_scanning(&self) -> bool {
        self.unicast != ADDR_UNASSIGNED && self.advertising
    }

    fn is_beaconing(&self) -> bool {
        self.unicast == ADDR_UNASSIGNED && self.advertising
    }
}

struct MeshState {
    nodes: Vec<Attached>,
    next_addr: UnicastAddr,
    unreachable: HashSet<UnicastAddr>,
}

impl MeshState {
    fn deliver_beacons(&self) {
        for scanner in self.nodes.iter().filter(|n| n.is_scanning()) {
            for device in self.nodes.iter().filter(|n| n.is_beaconing()) {
                scanner.emit(MeshEvent::Provisioning(ProvEvent::UnprovisionedBeacon {
                    uuid: device.uuid,
                    bearer: Bearer::Adv,
                }));
            }
        }
    }

    fn find(&self, addr: UnicastAddr) -> Option<usize> {
        self.nodes.iter().position(|n| n.owns(addr))
    }
}

/// Shared medium; each attached node gets a [`LoopbackTransport`] and an
/// event receiver
#[derive(Clone)]
pub struct LoopbackMesh {
    state: Arc<Mutex<MeshState>>,
}

impl Default for LoopbackMesh {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMesh {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MeshState {
                nodes: vec![],
                next_addr: LOOPBACK_START_ADDR,
                unreachable: HashSet::new(),
            })),
        }
    }

    pub fn attach(
        &self,
        uuid: DeviceUuid,
        composition: CompositionData,
    ) -> (LoopbackTransport, UnboundedReceiver<MeshEvent>) {
        let (events, rx) = unbounded_channel();
        let index = match self.state.lock() {
            Ok(mut state) => {
                state.nodes.push(Attached {
                    uuid,
                    composition,
                    events,
                    unicast: ADDR_UNASSIGNED,
                    net_idx: None,
                    advertising: false,
                    bound: HashSet::new(),
                });
                state.nodes.len() - 1
            }
            Err(_) => {
                log::error!("Loopback mesh lock poisoned, node left detached");
                usize::MAX
            }
        };
        (
            LoopbackTransport {
                state: self.state.clone(),
                index,
            },
            rx,
        )
    }

    /// Make sends to `addr` fail, or heal it again
    pub fn set_unreachable(&self, addr: UnicastAddr, unreachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            if unreachable {
                state.unreachable.insert(addr);
            } else {
                state.unreachable.remove(&addr);
            }
        }
    }

    /// Models bound at a provisioned node, as its config server sees them
    pub fn bound_models(&self, addr: UnicastAddr) -> Vec<ModelBinding> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.find(addr).map(|i| s.nodes[i].bound.iter().copied().collect()))
            .unwrap_or_default()
    }
}

pub struct LoopbackTransport {
    state: Arc<Mutex<MeshState>>,
    index: usize,
}

impl LoopbackTransport {
    fn lock(&self) -> Result<MutexGuard<'_, MeshState>, TransportError> {
        let state = self
            .state
            .lock()
            .map_err(|_| TransportError::Other("loopback mesh lock poisoned".to_string()))?;
        if self.index >= state.nodes.len() {
            return Err(TransportError::Detached);
        }
        Ok(state)
    }
}

/// Answer a configuration message on behalf of the target's config server
fn config_server(
    state: &mut MeshState,
    target: usize,
    msg: &OutboundMessage,
) -> Option<(Opcode, Vec<u8>)> {
    let node = &mut state.nodes[target];
    match msg.opcode {
        sig::COMPOSITION_DATA_GET => Some((
            sig::COMPOSITION_DATA_STATUS,
            node.composition.encode_status(),
        )),
        sig::APP_KEY_ADD => {
            let add = AppKeyAdd::decode(&msg.payload)
                .map_err(|e| log::warn!("Bad AppKey Add for 0x{:04x}: {e:}", node.unicast))
                .ok()?;
            if node.net_idx != Some(add.net_idx) {
                return Some((sig::APP_KEY_STATUS, add.status(STATUS_INVALID_NETKEY_INDEX)));
            }
            node.emit(MeshEvent::Provisioning(ProvEvent::AppKeyAdded {
                net_idx: add.net_idx,
                app_idx: add.app_idx,
                key: add.key,
            }));
            Some((sig::APP_KEY_STATUS, add.status(STATUS_SUCCESS)))
        }
        sig::MODEL_APP_BIND => {
            let bind = ModelAppBind::decode(&msg.payload)
                .map_err(|e| log::warn!("Bad Model App Bind for 0x{:04x}: {e:}", node.unicast))
                .ok()?;
            let present = node
                .composition
                .models_matching(node.unicast, &[bind.binding.model])
                .contains(&(bind.binding.element, bind.binding.model));
            if !present {
                return Some((sig::MODEL_APP_STATUS, bind.status(STATUS_INVALID_MODEL)));
            }
            node.bound.insert(bind.binding);
            node.emit(MeshEvent::Provisioning(ProvEvent::ModelBound {
                binding: bind.binding,
                app_idx: bind.app_idx,
            }));
            Some((sig::MODEL_APP_STATUS, bind.status(STATUS_SUCCESS)))
        }
        other => {
            log::debug!("Loopback config server ignores {other}");
            None
        }
    }
}

impl MeshTransport for LoopbackTransport {
    fn init(&mut self, _uuid: &DeviceUuid) -> Result<(), TransportError> {
        let state = self.lock()?;
        state.nodes[self.index].emit(MeshEvent::Provisioning(ProvEvent::RegisterComplete { err: 0 }));
        Ok(())
    }

    fn enable_provisioning(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let node = &mut state.nodes[self.index];
        node.advertising = true;
        node.emit(MeshEvent::Provisioning(ProvEvent::EnableComplete { err: 0 }));
        state.deliver_beacons();
        Ok(())
    }

    fn disable_provisioning(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        state.nodes[self.index].advertising = false;
        Ok(())
    }

    fn add_unprovisioned_device(&mut self, uuid: &DeviceUuid) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let net_idx = state.nodes[self.index].net_idx.unwrap_or_default();
        let Some(device) = state
            .nodes
            .iter()
            .position(|n| n.uuid == *uuid && n.is_beaconing())
        else {
            state.nodes[self.index].emit(MeshEvent::Provisioning(ProvEvent::PeerFailed {
                uuid: *uuid,
                reason: -1,
            }));
            return Ok(());
        };

        let unicast = state.next_addr;
        let element_count = state.nodes[device].composition.element_count();
        state.next_addr = unicast.wrapping_add(element_count as u16);

        let dev = &mut state.nodes[device];
        dev.unicast = unicast;
        dev.net_idx = Some(net_idx);
        dev.advertising = false;
        dev.emit(MeshEvent::Provisioning(ProvEvent::LinkOpen(Bearer::Adv)));
        dev.emit(MeshEvent::Provisioning(ProvEvent::Complete {
            net_idx,
            unicast,
            iv_index: 0,
            flags: 0,
        }));
        dev.emit(MeshEvent::Provisioning(ProvEvent::LinkClose(Bearer::Adv)));
        log::debug!("Loopback assigned 0x{unicast:04x} to {uuid:02x?}");

        state.nodes[self.index].emit(MeshEvent::Provisioning(ProvEvent::PeerProvisioned {
            uuid: *uuid,
            unicast,
            element_count,
            net_idx,
        }));
        Ok(())
    }

    fn add_local_app_key(
        &mut self,
        net_idx: KeyIndex,
        app_idx: KeyIndex,
        key: &AppKey,
    ) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        log::debug!("Loopback local app key 0x{app_idx:04x} ({} octets)", key.len());
        state.nodes[self.index].net_idx = Some(net_idx);
        Ok(())
    }

    fn bind_local_model(
        &mut self,
        binding: ModelBinding,
        _app_idx: KeyIndex,
    ) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let node = &mut state.nodes[self.index];
        // the provisioner assigns its own address before binding
        node.unicast = binding.element;
        node.bound.insert(binding);
        Ok(())
    }

    fn send(&mut self, msg: &OutboundMessage) -> Result<(), TransportError> {
        let mut state = self.lock()?;
        let src = state.nodes[self.index].unicast;
        if src == ADDR_UNASSIGNED {
            return Err(TransportError::Detached);
        }
        let dst = msg.ctx.dst;
        if state.unreachable.contains(&dst) {
            return Err(TransportError::Send {
                opcode: msg.opcode,
                dst,
                code: -1,
            });
        }

        let inbound = InboundMessage {
            src,
            dst,
            opcode: msg.opcode,
            payload: msg.payload.clone(),
        };

        if dst == ADDR_ALL_NODES {
            for (i, node) in state.nodes.iter().enumerate() {
                if i != self.index && node.unicast != ADDR_UNASSIGNED {
                    node.emit(MeshEvent::Message(inbound.clone()));
                }
            }
        } else {
            let target = state.find(dst).ok_or(TransportError::Unreachable(dst))?;
            if msg.opcode.uses_device_key() {
                if let Some((opcode, payload)) = config_server(&mut state, target, msg) {
                    state.nodes[self.index].emit(MeshEvent::Message(InboundMessage {
                        src: dst,
                        dst: src,
                        opcode,
                        payload,
                    }));
                }
            } else {
                state.nodes[target].emit(MeshEvent::Message(inbound));
            }
        }

        state.nodes[self.index].emit(MeshEvent::SendComplete {
            opcode: msg.opcode,
            dst,
            err: 0,
        });
        Ok(())
    }
}

/// Pub/sub transport that only logs, for running without a broker
pub struct LogPublisher;

impl PubSubTransport for LogPublisher {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos, retain: bool) -> Result<(), BridgeError> {
        log::info!(
            "mqtt(LOG): topic='{topic}' len={} QoS{} retain={retain} {}",
            payload.len(),
            qos.level(),
            String::from_utf8_lossy(payload)
        );
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), BridgeError> {
        log::info!("mqtt(LOG): subscribe '{topic}' QoS{}", qos.level());
        Ok(())
    }
}

#[derive(Default)]
struct Recorded {
    published: Vec<(String, Vec<u8>)>,
    subscriptions: Vec<String>,
    failing: bool,
}

/// Pub/sub double recording every publish; clones share the record
#[derive(Clone, Default)]
pub struct RecordingPublisher(Arc<Mutex<Recorded>>);

impl RecordingPublisher {
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.0.lock().map(|r| r.published.clone()).unwrap_or_default()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.0.lock().map(|r| r.subscriptions.clone()).unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut r) = self.0.lock() {
            r.failing = failing;
        }
    }
}

impl PubSubTransport for RecordingPublisher {
    fn publish(&mut self, topic: &str, payload: &[u8], _qos: Qos, _retain: bool) -> Result<(), BridgeError> {
        let mut r = self
            .0
            .lock()
            .map_err(|_| BridgeError::Publish(topic.to_string()))?;
        if r.failing {
            return Err(BridgeError::Publish(topic.to_string()));
        }
        r.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, _qos: Qos) -> Result<(), BridgeError> {
        let mut r = self
            .0
            .lock()
            .map_err(|_| BridgeError::Subscribe(topic.to_string()))?;
        r.subscriptions.push(topic.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct Script {
    calls: Vec<String>,
    sent: Vec<OutboundMessage>,
    init_err: Option<i32>,
    failing: HashSet<UnicastAddr>,
}

/// Mesh transport double: records every call in order and can be told to
/// fail init or sends to given destinations. Clones share the script.
#[derive(Clone, Default)]
pub struct ScriptedTransport(Arc<Mutex<Script>>);

impl ScriptedTransport {
    pub fn calls(&self) -> Vec<String> {
        self.0.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Messages the transport accepted, in order
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.0.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    pub fn fail_init(&self, code: i32) {
        if let Ok(mut s) = self.0.lock() {
            s.init_err = Some(code);
        }
    }

    pub fn fail_destination(&self, dst: UnicastAddr) {
        if let Ok(mut s) = self.0.lock() {
            s.failing.insert(dst);
        }
    }

    fn record(&self, call: &str) -> Result<MutexGuard<'_, Script>, TransportError> {
        let mut s = self
            .0
            .lock()
            .map_err(|_| TransportError::Other("script lock poisoned".to_string()))?;
        s.calls.push(call.to_string());
        Ok(s)
    }
}

impl MeshTransport for ScriptedTransport {
    fn init(&mut self, _uuid: &DeviceUuid) -> Result<(), TransportError> {
        let s = self.record("init")?;
        match s.init_err {
            Some(code) => Err(TransportError::Init(code)),
            None => Ok(()),
        }
    }

    fn enable_provisioning(&mut self) -> Result<(), TransportError> {
        self.record("enable_provisioning").map(|_| ())
    }

    fn disable_provisioning(&mut self) -> Result<(), TransportError> {
        self.record("disable_provisioning").map(|_| ())
    }

    fn add_unprovisioned_device(&mut self, _uuid: &DeviceUuid) -> Result<(), TransportError> {
        self.record("add_unprovisioned_device").map(|_| ())
    }

    fn add_local_app_key(
        &mut self,
        _net_idx: KeyIndex,
        _app_idx: KeyIndex,
        _key: &AppKey,
    ) -> Result<(), TransportError> {
        self.record("add_local_app_key").map(|_| ())
    }

    fn bind_local_model(
        &mut self,
        _binding: ModelBinding,
        _app_idx: KeyIndex,
    ) -> Result<(), TransportError> {
        self.record("bind_local_model").map(|_| ())
    }

    fn send(&mut self, msg: &OutboundMessage) -> Result<(), TransportError> {
        let mut s = self.record("send")?;
        if s.failing.contains(&msg.ctx.dst) {
            return Err(TransportError::Send {
                opcode: msg.opcode,
                dst: msg.ctx.dst,
                code: -1,
            });
        }
        s.sent.push(msg.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::NodeConfig,
        node::NodeParts,
        payload::TypedPayload,
        payload::VendorTid,
        transport::{AccessKey, MessageCtx},
        ModelKey,
    };

    fn drain(rx: &mut UnboundedReceiver<MeshEvent>) -> Vec<MeshEvent> {
        let mut out = vec![];
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn provisions_beaconing_device() {
        let mesh = LoopbackMesh::new();
        let pcfg = NodeConfig::provisioner();
        let dcfg = NodeConfig::dht_server();
        let (mut prov, mut prx) = mesh.attach(pcfg.uuid, NodeParts::composition_for(&pcfg));
        let (mut dev, mut drx) = mesh.attach(dcfg.uuid, NodeParts::composition_for(&dcfg));

        dev.init(&dcfg.uuid).unwrap();
        dev.enable_provisioning().unwrap();
        prov.init(&pcfg.uuid).unwrap();
        prov.add_local_app_key(0, 0, &[0x12; 16]).unwrap();
        prov.bind_local_model(
            ModelBinding {
                model: ModelKey::vendor(pcfg.company_id, ModelKey::VND_CLIENT_ID),
                element: 0x0001,
            },
            0,
        )
        .unwrap();
        prov.enable_provisioning().unwrap();

        let events = drain(&mut prx);
        assert!(events.contains(&MeshEvent::Provisioning(ProvEvent::UnprovisionedBeacon {
            uuid: dcfg.uuid,
            bearer: Bearer::Adv
        })));

        prov.add_unprovisioned_device(&dcfg.uuid).unwrap();
        let events = drain(&mut drx);
        assert!(events.contains(&MeshEvent::Provisioning(ProvEvent::Complete {
            net_idx: 0,
            unicast: LOOPBACK_START_ADDR,
            iv_index: 0,
            flags: 0
        })));

        let probe = OutboundMessage {
            ctx: MessageCtx {
                net_idx: 0,
                key: AccessKey::App(0),
                dst: LOOPBACK_START_ADDR,
                ttl: 3,
            },
            sender: ModelKey::vendor(pcfg.company_id, ModelKey::VND_CLIENT_ID),
            opcode: crate::VendorOp::Send.opcode(pcfg.company_id),
            payload: VendorTid(1).encode(),
        };
        prov.send(&probe).unwrap();
        assert!(drain(&mut drx)
            .iter()
            .any(|e| matches!(e, MeshEvent::Message(m) if m.src == 0x0001)));

        mesh.set_unreachable(LOOPBACK_START_ADDR, true);
        assert!(prov.send(&probe).is_err());
        let mut to_nowhere = probe.clone();
        to_nowhere.ctx.dst = 0x0040;
        mesh.set_unreachable(LOOPBACK_START_ADDR, false);
        assert_eq!(prov.send(&to_nowhere), Err(TransportError::Unreachable(0x0040)));
    }

    #[test]
    fn scripted_transport_fails_one_destination() {
        let mut t = ScriptedTransport::default();
        t.fail_destination(0x0001);
        let mut msg = OutboundMessage {
            ctx: MessageCtx {
                net_idx: 0,
                key: AccessKey::App(0),
                dst: 0x0001,
                ttl: 3,
            },
            sender: ModelKey::SENSOR_CLIENT,
            opcode: sig::SENSOR_GET,
            payload: vec![],
        };
        assert!(t.send(&msg).is_err());
        msg.ctx.dst = ADDR_ALL_NODES;
        assert!(t.send(&msg).is_ok());
        assert_eq!(t.sent().len(), 1);
        assert_eq!(t.calls(), vec!["send".to_string(), "send".to_string()]);
    }
}
