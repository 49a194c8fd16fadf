use thiserror::Error;

use crate::{
    opcode::Opcode, AppKey, DeviceUuid, KeyIndex, ModelBinding, UnicastAddr, ADDR_ALL_NODES,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Mesh stack init failed, err {0}")]
    Init(i32),
    #[error("Provisioning enable failed, err {0}")]
    Enable(i32),
    #[error("No route to 0x{0:04x}")]
    Unreachable(UnicastAddr),
    #[error("Send of {opcode} to 0x{dst:04x} failed, err {code}")]
    Send {
        opcode: Opcode,
        dst: UnicastAddr,
        code: i32,
    },
    #[error("Transport not attached to a mesh")]
    Detached,
    #[error("Transport Error {0}")]
    Other(String),
}

/// Key securing an access message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKey {
    /// Per-device key, used by configuration messages
    Device,
    App(KeyIndex),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCtx {
    pub net_idx: KeyIndex,
    pub key: AccessKey,
    pub dst: UnicastAddr,
    pub ttl: u8,
}

impl MessageCtx {
    pub fn is_broadcast(&self) -> bool {
        self.dst == ADDR_ALL_NODES
    }
}

/// Fully addressed message handed to the mesh stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub ctx: MessageCtx,
    /// Local model the message is sent from
    pub sender: crate::ModelKey,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Frame delivered by the mesh stack's model operation callback. The
/// payload is raw: nothing has checked its length yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub src: UnicastAddr,
    pub dst: UnicastAddr,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Primitives consumed from the external mesh stack. All calls return
/// once the request is queued; results arrive later as events on the
/// node's event stream.
pub trait MeshTransport: Send {
    /// Register the node with the stack
    fn init(&mut self, uuid: &DeviceUuid) -> Result<(), TransportError>;
    /// Start advertising (node) or scanning (provisioner)
    fn enable_provisioning(&mut self) -> Result<(), TransportError>;
    fn disable_provisioning(&mut self) -> Result<(), TransportError>;
    /// Provisioner: provision a device seen in an unprovisioned beacon
    fn add_unprovisioned_device(&mut self, uuid: &DeviceUuid) -> Result<(), TransportError>;
    fn add_local_app_key(
        &mut self,
        net_idx: KeyIndex,
        app_idx: KeyIndex,
        key: &AppKey,
    ) -> Result<(), TransportError>;
    fn bind_local_model(
        &mut self,
        binding: ModelBinding,
        app_idx: KeyIndex,
    ) -> Result<(), TransportError>;
    fn send(&mut self, msg: &OutboundMessage) -> Result<(), TransportError>;
}
