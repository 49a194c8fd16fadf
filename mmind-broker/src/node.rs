use mmind_sensor::{Actuator, RandomWalk, Sampler, SensorError, SimulatedLed};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::{
    composition::{CompositionData, Element},
    config::{NodeConfig, Role},
    dispatch::{DispatchError, DispatchTable, Dispatched, HandlerKind},
    opcode::{sig, Opcode, VendorOp},
    payload::{self, DhtReading, LdrReading, LedControl, PayloadError, TypedPayload},
    provisioning::{
        NodeIdentity, ProvAction, ProvEvent, ProvisionedPeer, Provisioning, ProvisioningError,
        ProvisioningState,
    },
    reading::Reading,
    sensor_data::{self, PropertyId, SensorDataError},
    server::{ServerEngine, ServerError},
    store::{PersistedState, StateStore, StoreError},
    tracker::{Tracker, TrackerError, TrackerEvent, TrackerOutput},
    transport::{InboundMessage, MeshTransport, OutboundMessage, TransportError},
    ModelBinding, ModelKey, Tid, UnicastAddr, ADDR_UNASSIGNED,
};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Mesh startup failed: {0}")]
    Startup(TransportError),
    #[error("Transport Error")]
    Transport(#[from] TransportError),
    #[error("Provisioning Error")]
    Provisioning(#[from] ProvisioningError),
    #[error("Dispatch Error")]
    Dispatch(#[from] DispatchError),
    #[error("Tracker Error")]
    Tracker(#[from] TrackerError),
    #[error("Server Error")]
    Server(#[from] ServerError),
    #[error("Store Error")]
    Store(#[from] StoreError),
    #[error("Payload Error")]
    Payload(#[from] PayloadError),
    #[error("Sensor data Error")]
    SensorData(#[from] SensorDataError),
    #[error("Sensor Error")]
    Sensor(#[from] SensorError),
    #[error("No server address known")]
    NoTarget,
    #[error("{0} is not a sensor request")]
    NotSensorRequest(Opcode),
}

/// Everything the mesh stack reports to a node
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Provisioning(ProvEvent),
    Message(InboundMessage),
    /// Completion of an earlier send; nonzero `err` means it failed
    SendComplete {
        opcode: Opcode,
        dst: UnicastAddr,
        err: i32,
    },
}

/// What a node reports upward, to the bridge or any other observer
#[derive(Debug, Clone, PartialEq)]
pub enum NodeNotice {
    Ready { unicast: UnicastAddr },
    Teardown,
    Reading { src: UnicastAddr, reading: Reading },
    PeerProvisioned(ProvisionedPeer),
    Configured { target: UnicastAddr, bound: Vec<ModelBinding> },
    ProbeEcho { target: UnicastAddr, tid: Tid, rtt: Duration },
    /// The server receiving control commands is known
    TargetKnown(UnicastAddr),
}

/// External collaborators of a node
pub struct NodeParts {
    pub transport: Box<dyn MeshTransport>,
    pub store: Box<dyn StateStore>,
    pub samplers: Vec<Box<dyn Sampler>>,
    pub actuator: Option<Box<dyn Actuator>>,
}

impl NodeParts {
    pub fn new(transport: Box<dyn MeshTransport>, store: Box<dyn StateStore>) -> Self {
        Self {
            transport,
            store,
            samplers: vec![],
            actuator: None,
        }
    }

    pub fn with_samplers(mut self, samplers: Vec<Box<dyn Sampler>>) -> Self {
        self.samplers = samplers;
        self
    }

    pub fn with_actuator(mut self, actuator: Box<dyn Actuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    /// Random-walk samplers for the role's channels and a simulated LED
    pub fn simulated(
        cfg: &NodeConfig,
        transport: Box<dyn MeshTransport>,
        store: Box<dyn StateStore>,
    ) -> Result<Self, NodeError> {
        let samplers: Vec<Box<dyn Sampler>> = match cfg.role {
            Role::Provisioner => vec![],
            Role::DhtServer | Role::SensorServer => vec![
                Box::new(RandomWalk::temperature()?),
                Box::new(RandomWalk::humidity()?),
            ],
            Role::LdrServer => vec![Box::new(RandomWalk::light()?)],
        };
        let parts = Self::new(transport, store).with_samplers(samplers);
        Ok(match cfg.role {
            Role::Provisioner => parts,
            _ => parts.with_actuator(Box::new(SimulatedLed::new())),
        })
    }

    /// Composition Data page 0 advertised by a node of this configuration
    pub fn composition_for(cfg: &NodeConfig) -> CompositionData {
        let cid = cfg.company_id;
        let (sig_models, vendor_models) = match cfg.role {
            Role::Provisioner => (
                vec![
                    ModelKey::CONFIG_SERVER.id,
                    ModelKey::CONFIG_CLIENT.id,
                    ModelKey::SENSOR_CLIENT.id,
                ],
                vec![(cid, ModelKey::VND_CLIENT_ID)],
            ),
            Role::DhtServer | Role::LdrServer => (
                vec![ModelKey::CONFIG_SERVER.id],
                vec![(cid, ModelKey::VND_SERVER_ID)],
            ),
            Role::SensorServer => (
                vec![
                    ModelKey::CONFIG_SERVER.id,
                    ModelKey::SENSOR_SERVER.id,
                    ModelKey::SENSOR_SETUP_SERVER.id,
                ],
                vec![(cid, ModelKey::VND_SERVER_ID)],
            ),
        };
        CompositionData {
            cid,
            pid: 0,
            vid: 0,
            crpl: 10,
            features: 0,
            elements: vec![Element {
                loc: 0,
                sig_models,
                vendor_models,
            }],
        }
    }
}

fn dispatch_table(cfg: &NodeConfig) -> Result<DispatchTable, DispatchError> {
    let cid = cfg.company_id;
    let mut table = DispatchTable::new();
    match cfg.role {
        Role::Provisioner => {
            table.register_model(
                ModelKey::vendor(cid, ModelKey::VND_CLIENT_ID),
                HandlerKind::ClientResponse,
                &[
                    VendorOp::Status.opcode(cid),
                    VendorOp::DhtData.opcode(cid),
                    VendorOp::LdrData.opcode(cid),
                ],
            )?;
            table.register_model(
                ModelKey::CONFIG_CLIENT,
                HandlerKind::ClientResponse,
                &sig::CONFIG_CLIENT_RESPONSES,
            )?;
            table.register_model(
                ModelKey::SENSOR_CLIENT,
                HandlerKind::ClientResponse,
                &sig::SENSOR_CLIENT_RESPONSES,
            )?;
        }
        Role::DhtServer | Role::LdrServer | Role::SensorServer => {
            table.register_model(
                ModelKey::vendor(cid, ModelKey::VND_SERVER_ID),
                HandlerKind::ServerRequest,
                &[VendorOp::Send.opcode(cid), VendorOp::LedCtrl.opcode(cid)],
            )?;
            if cfg.role == Role::SensorServer {
                table.register_model(
                    ModelKey::SENSOR_SERVER,
                    HandlerKind::ServerRequest,
                    &sig::SENSOR_SERVER_REQUESTS,
                )?;
            }
        }
    }
    Ok(table)
}

/// One mesh node: provisioning state, dispatch, client tracker and
/// server engine composed behind a single event entry point.
///
/// Nothing is sent before provisioning reports the node ready. Every send
/// is independent; a failed send is logged and does not affect others.
pub struct MeshNode {
    cfg: NodeConfig,
    prov: Provisioning,
    table: DispatchTable,
    tracker: Tracker,
    server: ServerEngine,
    transport: Box<dyn MeshTransport>,
    store: Box<dyn StateStore>,
    persisted: PersistedState,
    server_addr: Option<UnicastAddr>,
    descriptor_property: Option<PropertyId>,
    started: Instant,
}

impl MeshNode {
    pub fn new(cfg: NodeConfig, parts: NodeParts) -> Result<Self, NodeError> {
        let table = dispatch_table(&cfg)?;
        let prov = match cfg.role {
            Role::Provisioner => Provisioning::provisioner(cfg.uuid, cfg.uuid_match.clone()),
            _ => Provisioning::node(cfg.uuid),
        };
        let mut tracker = Tracker::new(cfg.company_id, cfg.retry, cfg.request_timeout());
        tracker.set_bind_models(vec![
            ModelKey::vendor(cfg.company_id, ModelKey::VND_SERVER_ID),
            ModelKey::SENSOR_SERVER,
            ModelKey::SENSOR_SETUP_SERVER,
        ]);
        let server = ServerEngine::new(&cfg, parts.samplers, parts.actuator);

        log::info!(
            "Node {} ({:?}) with {} routed opcodes",
            cfg.name,
            cfg.role,
            table.len()
        );
        Ok(Self {
            cfg,
            prov,
            table,
            tracker,
            server,
            transport: parts.transport,
            store: parts.store,
            persisted: PersistedState::default(),
            server_addr: None,
            descriptor_property: None,
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    pub fn identity(&self) -> &NodeIdentity {
        self.prov.identity()
    }

    pub fn state(&self) -> ProvisioningState {
        self.prov.state()
    }

    pub fn peers(&self) -> Vec<ProvisionedPeer> {
        self.prov.peers().cloned().collect()
    }

    pub fn server_addr(&self) -> Option<UnicastAddr> {
        self.server_addr
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn server(&self) -> &ServerEngine {
        &self.server
    }

    /// Property id learned from the last Descriptor Status
    pub fn recorded_property(&self) -> Option<PropertyId> {
        self.descriptor_property
    }

    /// Register with the stack and enable provisioning. The provisioner
    /// also restores persisted state, installs its own keys and provisions
    /// itself first. Failures here are fatal.
    pub fn start(&mut self) -> Result<Vec<NodeNotice>, NodeError> {
        self.transport.init(&self.cfg.uuid).map_err(|e| {
            log::error!("Mesh stack init failed {e:}");
            NodeError::Startup(e)
        })?;

        let mut notices = vec![];
        if self.cfg.role == Role::Provisioner {
            notices.extend(self.restore());

            let (net_idx, app_idx, key) = (self.cfg.net_idx, self.cfg.app_idx, self.cfg.app_key);
            self.transport
                .add_local_app_key(net_idx, app_idx, &key)
                .map_err(|e| {
                    log::error!("Unable to add local app key {e:}");
                    NodeError::Startup(e)
                })?;

            let actions = self
                .prov
                .self_provision(self.cfg.own_addr, net_idx, app_idx, key)?;
            notices.extend(self.apply(actions));

            for model in [
                ModelKey::vendor(self.cfg.company_id, ModelKey::VND_CLIENT_ID),
                ModelKey::SENSOR_CLIENT,
            ] {
                let binding = ModelBinding {
                    model,
                    element: self.cfg.own_addr,
                };
                self.transport
                    .bind_local_model(binding, app_idx)
                    .map_err(|e| {
                        log::error!("Unable to bind local {model:?} {e:}");
                        NodeError::Startup(e)
                    })?;
            }
        }

        self.transport.enable_provisioning().map_err(|e| {
            log::error!("Unable to enable provisioning {e:}");
            NodeError::Startup(e)
        })?;
        log::info!("Node {} started", self.cfg.name);
        Ok(notices)
    }

    fn restore(&mut self) -> Vec<NodeNotice> {
        let Some(state) = self
            .store
            .load()
            .map_err(|e| {
                log::error!("Unable to restore state {e:}");
                e
            })
            .ok()
            .flatten()
        else {
            return vec![];
        };
        log::info!("Restored {state:?}");
        self.persisted = state;
        self.tracker.restore_tid(state.vnd_tid);
        if state.server_addr != ADDR_UNASSIGNED {
            self.server_addr = Some(state.server_addr);
            return vec![NodeNotice::TargetKnown(state.server_addr)];
        }
        vec![]
    }

    fn persist(&mut self) {
        self.store
            .save(&self.persisted)
            .map_err(|e| {
                log::error!("Unable to persist state {e:}");
                e
            })
            .ok();
    }

    fn send_all(&mut self, msgs: Vec<OutboundMessage>) {
        for msg in msgs {
            self.transport
                .send(&msg)
                .map_err(|e| {
                    log::error!("Send {} to 0x{:04x} failed {e:}", msg.opcode, msg.ctx.dst);
                    e
                })
                .ok();
        }
    }

    /// Single entry point for the mesh stack's callbacks. Only
    /// registration/enable failures are returned; everything else is
    /// logged and contained.
    pub fn handle_event(&mut self, event: MeshEvent) -> Result<Vec<NodeNotice>, NodeError> {
        match event {
            MeshEvent::Provisioning(ev) => match self.prov.handle(ev) {
                Ok(actions) => Ok(self.apply(actions)),
                Err(ProvisioningError::UnassignedAddress) => Ok(vec![]),
                Err(e) => Err(e.into()),
            },
            MeshEvent::Message(msg) => Ok(self.on_message(msg)),
            MeshEvent::SendComplete { opcode, dst, err } => {
                if err != 0 {
                    log::warn!("Send of {opcode} to 0x{dst:04x} failed, err {err}");
                } else {
                    log::trace!("Sent {opcode} to 0x{dst:04x}");
                }
                Ok(vec![])
            }
        }
    }

    fn apply(&mut self, actions: Vec<ProvAction>) -> Vec<NodeNotice> {
        let mut notices = vec![];
        for action in actions {
            match action {
                ProvAction::Ready {
                    unicast, net_idx, ..
                } => {
                    self.tracker.set_keys(net_idx, self.cfg.ttl);
                    self.server.on_ready(unicast, net_idx);
                    notices.push(NodeNotice::Ready { unicast });
                }
                ProvAction::Teardown => {
                    self.tracker.reset();
                    self.server.on_teardown();
                    self.descriptor_property = None;
                    // the peer list is gone with the identity, forget the target too
                    if self.server_addr.take().is_some() {
                        self.persisted.server_addr = ADDR_UNASSIGNED;
                        self.persist();
                    }
                    notices.push(NodeNotice::Teardown);
                }
                ProvAction::AppKeyReady { app_idx, .. } => {
                    if let Some(key) = self.prov.identity().app_key {
                        self.tracker.set_app_key(app_idx, key);
                    }
                    self.server.on_app_key(app_idx);
                }
                ProvAction::Bound(binding) => self.server.on_bound(binding),
                ProvAction::AddDevice { uuid, .. } => {
                    self.transport
                        .add_unprovisioned_device(&uuid)
                        .map_err(|e| {
                            log::error!("Unable to add device {uuid:02x?} {e:}");
                            e
                        })
                        .ok();
                }
                ProvAction::PeerReady(peer) => {
                    let target = peer.unicast;
                    self.server_addr = Some(target);
                    self.persisted.server_addr = target;
                    self.persist();
                    notices.push(NodeNotice::PeerProvisioned(peer));
                    notices.push(NodeNotice::TargetKnown(target));

                    match self.tracker.start_configuration(target) {
                        Ok(out) => notices.extend(self.process(out)),
                        Err(e) => log::error!("Unable to configure 0x{target:04x} {e:}"),
                    }
                }
            }
        }
        notices
    }

    fn on_message(&mut self, msg: InboundMessage) -> Vec<NodeNotice> {
        if !self.prov.is_provisioned() {
            log::debug!("Not provisioned, dropping {} from 0x{:04x}", msg.opcode, msg.src);
            return vec![];
        }
        match self.table.dispatch(msg) {
            None => vec![],
            Some(Dispatched::Request { model, msg }) => {
                match self.server.handle_request(model, &msg) {
                    Ok(out) => self.send_all(out),
                    Err(e) => log::warn!(
                        "Dropping {} from 0x{:04x} ({} octets): {e:}",
                        msg.opcode,
                        msg.src,
                        msg.payload.len()
                    ),
                }
                vec![]
            }
            Some(Dispatched::Response { msg, .. }) => self.on_client_message(msg),
        }
    }

    fn on_client_message(&mut self, msg: InboundMessage) -> Vec<NodeNotice> {
        let company = self.cfg.company_id;
        let reading = match VendorOp::from_opcode(msg.opcode, company) {
            Some(VendorOp::DhtData) => DhtReading::decode(&msg.payload).map(Reading::Dht),
            Some(VendorOp::LdrData) => LdrReading::decode(&msg.payload).map(Reading::Ldr),
            _ => {
                let out = self.tracker.on_response(msg.opcode, msg.src, &msg.payload);
                return self.process(out);
            }
        };
        match reading {
            Ok(reading) => {
                log::info!("Reading from 0x{:04x}: {reading:?}", msg.src);
                vec![NodeNotice::Reading {
                    src: msg.src,
                    reading,
                }]
            }
            Err(e) => {
                log::warn!(
                    "Dropping {} from 0x{:04x} ({} octets): {e:}",
                    msg.opcode,
                    msg.src,
                    msg.payload.len()
                );
                vec![]
            }
        }
    }

    fn process(&mut self, out: TrackerOutput) -> Vec<NodeNotice> {
        self.send_all(out.outbound);
        let mut notices = vec![];
        for event in out.events {
            match event {
                TrackerEvent::Resolved {
                    target,
                    opcode,
                    payload,
                } => notices.extend(self.on_resolved(target, opcode, &payload)),
                TrackerEvent::ProbeEcho { target, tid, rtt } => {
                    notices.push(NodeNotice::ProbeEcho { target, tid, rtt })
                }
                TrackerEvent::TidAllocated(tid) => {
                    self.persisted.vnd_tid = tid;
                    self.persist();
                }
                TrackerEvent::Composition { target, data } => log::info!(
                    "0x{target:04x} composition: cid 0x{:04x}, {} element(s)",
                    data.cid,
                    data.element_count()
                ),
                TrackerEvent::ConfigStepDone { target, step } => {
                    log::debug!("0x{target:04x} finished {step:?}")
                }
                TrackerEvent::Configured { target, bound } => {
                    notices.push(NodeNotice::Configured { target, bound })
                }
                TrackerEvent::ConfigFailed {
                    target,
                    step,
                    reason,
                } => log::error!("0x{target:04x} left unconfigured at {step:?}: {reason:?}"),
                TrackerEvent::Abandoned {
                    target,
                    opcode,
                    retries,
                } => log::warn!("Gave up on {opcode} to 0x{target:04x} after {retries} retries"),
            }
        }
        notices
    }

    fn on_resolved(&mut self, target: UnicastAddr, opcode: Opcode, payload: &[u8]) -> Vec<NodeNotice> {
        match opcode {
            sig::SENSOR_STATUS => match sensor_data::decode_status(payload) {
                Ok(values) => vec![NodeNotice::Reading {
                    src: target,
                    reading: Reading::Sensor(values),
                }],
                Err(e) => {
                    log::warn!("Bad sensor status from 0x{target:04x}: {e:}");
                    vec![]
                }
            },
            sig::SENSOR_DESCRIPTOR_STATUS => {
                match sensor_data::parse_descriptors(payload) {
                    Ok(descriptors) => {
                        if let Some(first) = descriptors.first() {
                            log::info!(
                                "0x{target:04x} reports {} descriptor(s), using property 0x{:04x}",
                                descriptors.len(),
                                first.property
                            );
                            self.descriptor_property = Some(first.property);
                        } else {
                            log::warn!("0x{target:04x} has no such sensor property");
                        }
                    }
                    Err(e) => log::warn!("Bad descriptor status from 0x{target:04x}: {e:}"),
                }
                vec![]
            }
            other => {
                log::info!("0x{target:04x} answered {other} ({} octets)", payload.len());
                vec![]
            }
        }
    }

    /// Fire due response timeouts
    pub fn tick(&mut self, now: Instant) -> Vec<NodeNotice> {
        let out = self.tracker.poll_timeouts(now);
        self.process(out)
    }

    /// Periodic publish timer body
    pub fn publish_tick(&mut self) {
        match self.server.publish_tick() {
            Ok(out) => self.send_all(out),
            Err(e) => log::error!("Publish failed {e:}"),
        }
    }

    fn target_or_server(&self, target: Option<UnicastAddr>) -> Result<UnicastAddr, NodeError> {
        target.or(self.server_addr).ok_or(NodeError::NoTarget)
    }

    /// Vendor SEND probe; defaults to the last configured server
    pub fn send_probe(&mut self, target: Option<UnicastAddr>) -> Result<Tid, NodeError> {
        let target = self.target_or_server(target)?;
        let (tid, out) = self.tracker.send_probe(target)?;
        self.process(out);
        Ok(tid)
    }

    pub fn send_led(&mut self, target: UnicastAddr, on: bool) -> Result<(), NodeError> {
        let payload = LedControl {
            on,
            timestamp: payload::uptime_ms(self.started.elapsed()),
        }
        .encode();
        let msg = self.tracker.unacknowledged(
            target,
            VendorOp::LedCtrl.opcode(self.cfg.company_id),
            payload,
        )?;
        self.transport.send(&msg).map_err(|e| {
            log::error!("LED control to 0x{target:04x} failed {e:}");
            e
        })?;
        Ok(())
    }

    pub fn sensor_get(
        &mut self,
        target: Option<UnicastAddr>,
        property: Option<PropertyId>,
    ) -> Result<(), NodeError> {
        let target = self.target_or_server(target)?;
        let out = self.tracker.sensor_get(target, property)?;
        self.process(out);
        Ok(())
    }

    pub fn descriptor_get(
        &mut self,
        target: Option<UnicastAddr>,
        property: Option<PropertyId>,
    ) -> Result<(), NodeError> {
        let target = self.target_or_server(target)?;
        let out = self.tracker.descriptor_get(target, property)?;
        self.process(out);
        Ok(())
    }

    /// Cadence, settings, column or series get for one property
    pub fn sensor_query(
        &mut self,
        target: Option<UnicastAddr>,
        opcode: Opcode,
        property: PropertyId,
    ) -> Result<(), NodeError> {
        if !sig::SENSOR_SERVER_REQUESTS.contains(&opcode) {
            return Err(NodeError::NotSensorRequest(opcode));
        }
        let target = self.target_or_server(target)?;
        let out = self.tracker.send_request(
            target,
            opcode,
            property.to_le_bytes().to_vec(),
            self.cfg.request_timeout(),
        )?;
        self.process(out);
        Ok(())
    }

    /// Local reset: same path as a reset reported by the stack
    pub fn reset(&mut self) -> Vec<NodeNotice> {
        match self.handle_event(MeshEvent::Provisioning(ProvEvent::Reset)) {
            Ok(notices) => notices,
            Err(e) => {
                log::error!("Reset failed {e:}");
                vec![]
            }
        }
    }
}
