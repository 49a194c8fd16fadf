//! The `mmind-broker` crate defines the application layer that runs on
//! every mesh-minder node: the logic that takes a node from unprovisioned
//! to actively exchanging typed sensor and control messages, and the glue
//! that carries mesh readings out to a pub/sub channel (and control
//! commands back in).
//!
//! The mesh stack itself (bearers, network layer, encryption) and the
//! MQTT client are external collaborators reached through the
//! [`MeshTransport`] and [`PubSubTransport`] traits. Everything in
//! between is composed as follows:
//!
//! 1. [`Provisioning`] owns the node identity and the
//!    `Unprovisioned -> Provisioning -> Provisioned` lifecycle. Nothing
//!    else sends until it reports the node ready.
//! 2. [`DispatchTable`] routes every inbound frame by exact opcode to
//!    either the client side (responses) or the server side (requests).
//! 3. [`Tracker`] issues acknowledged requests, matches responses to
//!    pending transactions and retries on timeout per an explicit
//!    [`RetryPolicy`]. It also drives the per-peer configuration sequence
//!    (Composition Data Get, AppKey Add, Model App Bind).
//! 4. [`ServerEngine`] answers requests from its cached readings and
//!    publishes periodic samples.
//! 5. [`BridgeAdapter`] owns the bridge session: it caches the latest
//!    reading, publishes it while connected, and turns control messages
//!    into mesh LED commands.
//!
//! [`MeshNode`] composes 1-4 behind one event entry point. The actix
//! [`NodeActor`] and [`BridgeActor`] host a node and a bridge on separate
//! mailboxes, handing readings and control commands across as messages.
//!
//! # Examples
//! ```no_run
//! use mmind_broker::{
//!     config::{BridgeConfig, NodeConfig},
//!     loopback::{LogPublisher, LoopbackMesh},
//!     BridgeAdapter, MemoryStore, MeshNode, NodeParts,
//! };
//!
//! #[actix::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mesh = LoopbackMesh::new();
//!     let cfg = NodeConfig::provisioner();
//!     let (transport, events) = mesh.attach(cfg.uuid, NodeParts::composition_for(&cfg));
//!
//!     let node = MeshNode::new(cfg, NodeParts::new(Box::new(transport), Box::new(MemoryStore::default())))?;
//!     let bridge = BridgeAdapter::new(BridgeConfig::default(), Box::new(LogPublisher));
//!
//!     let (_node, _bridge) = mmind_broker::gateway(node, events, bridge).map_err(|e| {
//!         log::error!("Error starting gateway {e:}");
//!         e
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod loopback;

mod actor;
mod bridge;
mod composition;
mod config_msg;
mod dispatch;
mod node;
mod opcode;
mod payload;
mod provisioning;
mod reading;
mod sensor_data;
mod server;
mod store;
mod tracker;
mod transport;

pub use actor::{
    gateway, spawn_node, BridgeActor, ControlLed, GetBridgeSession, GetNodeStatus, NodeActor,
    NodeStatus, Notify, PubSubEvent, ResetNode, SendProbe, SensorGet, Subscribe, TIMEOUT_POLL_MS,
};
pub use bridge::{
    parse_control, BridgeAdapter, BridgeError, BridgeRecord, BridgeSession, Connectivity,
    PubSubTransport,
};
pub use composition::{CompositionData, Element};
pub use config::{Qos, RetryPolicy, Role, UuidMatch};
pub use dispatch::{DispatchError, DispatchTable, Dispatched, HandlerKind, Route};
pub use node::{MeshEvent, MeshNode, NodeError, NodeNotice, NodeParts};
pub use opcode::{sig, Opcode, OpcodeError, VendorOp};
pub use payload::{
    DhtReading, LdrReading, LedControl, LightStatus, PayloadError, TypedPayload, VendorTid,
};
pub use provisioning::{
    Bearer, NodeIdentity, ProvAction, ProvEvent, ProvisionedPeer, Provisioning, ProvisioningError,
    ProvisioningState,
};
pub use reading::{Reading, Snapshot};
pub use sensor_data::{
    PropertyId, SensorDataError, SensorDescriptor, SensorEntry, SensorValue,
    PRESENT_AMBIENT_LIGHT_LEVEL, PRESENT_AMBIENT_RELATIVE_HUMIDITY, PRESENT_AMBIENT_TEMPERATURE,
    PRESENT_INDOOR_AMBIENT_TEMPERATURE, PRESENT_OUTDOOR_AMBIENT_TEMPERATURE,
};
pub use server::{ServerEngine, ServerError};
pub use store::{JsonFileStore, MemoryStore, PersistedState, StateStore, StoreError};
pub use tracker::{
    ConfigFailure, ConfigStep, PendingTransaction, Tracker, TrackerError, TrackerEvent,
    TrackerOutput, MAX_QUEUED,
};
pub use transport::{
    AccessKey, InboundMessage, MeshTransport, MessageCtx, OutboundMessage, TransportError,
};

/// Element unicast address. `0x0000` is the unassigned sentinel
pub type UnicastAddr = u16;

/// Bluetooth SIG assigned company identifier
pub type CompanyId = u16;

pub type ModelId = u16;

/// 12 bit NetKey / AppKey index
pub type KeyIndex = u16;

/// Transaction id of the vendor probe
pub type Tid = u16;

pub type AppKey = [u8; 16];

/// 128 bit device UUID, fixed at flash time
pub type DeviceUuid = [u8; 16];

pub const ADDR_UNASSIGNED: UnicastAddr = 0x0000;

/// All-nodes group address
pub const ADDR_ALL_NODES: UnicastAddr = 0xFFFF;

/// Identifies a model by company (SIG models carry none) and model id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    pub company: Option<CompanyId>,
    pub id: ModelId,
}

impl ModelKey {
    pub const CONFIG_SERVER: ModelKey = ModelKey::sig(0x0000);
    pub const CONFIG_CLIENT: ModelKey = ModelKey::sig(0x0001);
    pub const SENSOR_SERVER: ModelKey = ModelKey::sig(0x1100);
    pub const SENSOR_SETUP_SERVER: ModelKey = ModelKey::sig(0x1101);
    pub const SENSOR_CLIENT: ModelKey = ModelKey::sig(0x1102);

    pub const VND_CLIENT_ID: ModelId = 0x0000;
    pub const VND_SERVER_ID: ModelId = 0x0001;

    pub const fn sig(id: ModelId) -> Self {
        Self { company: None, id }
    }

    pub const fn vendor(company: CompanyId, id: ModelId) -> Self {
        Self {
            company: Some(company),
            id,
        }
    }

    pub fn is_vendor(&self) -> bool {
        self.company.is_some()
    }
}

/// A model instance at a specific element: the addressing unit for
/// configuration and for server side bind checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelBinding {
    pub model: ModelKey,
    pub element: UnicastAddr,
}
