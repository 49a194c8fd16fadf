use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::{
    config::UuidMatch, AppKey, DeviceUuid, KeyIndex, ModelBinding, UnicastAddr, ADDR_UNASSIGNED,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("Mesh stack registration failed, err {0}")]
    Register(i32),
    #[error("Provisioning enable failed, err {0}")]
    Enable(i32),
    #[error("Provisioning complete with unassigned address")]
    UnassignedAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Unprovisioned,
    Provisioning,
    Provisioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bearer {
    Adv,
    Gatt,
}

/// Identity and key material of this node. Address and key fields are
/// filled exactly once per provisioning and cleared on reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub uuid: DeviceUuid,
    pub unicast: UnicastAddr,
    pub net_idx: Option<KeyIndex>,
    pub app_idx: Option<KeyIndex>,
    pub app_key: Option<AppKey>,
    pub iv_index: u32,
    pub flags: u8,
}

impl NodeIdentity {
    pub fn new(uuid: DeviceUuid) -> Self {
        Self {
            uuid,
            unicast: ADDR_UNASSIGNED,
            net_idx: None,
            app_idx: None,
            app_key: None,
            iv_index: 0,
            flags: 0,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.unicast != ADDR_UNASSIGNED
    }

    fn clear(&mut self) {
        *self = Self::new(self.uuid);
    }
}

/// Events reported by the mesh stack about provisioning and local
/// configuration state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvEvent {
    RegisterComplete {
        err: i32,
    },
    EnableComplete {
        err: i32,
    },
    LinkOpen(Bearer),
    LinkClose(Bearer),
    Complete {
        net_idx: KeyIndex,
        unicast: UnicastAddr,
        iv_index: u32,
        flags: u8,
    },
    Reset,
    /// Local config server stored an application key
    AppKeyAdded {
        net_idx: KeyIndex,
        app_idx: KeyIndex,
        key: AppKey,
    },
    /// Local config server bound a model to an application key
    ModelBound {
        binding: ModelBinding,
        app_idx: KeyIndex,
    },
    /// Provisioner: beacon from an unprovisioned device
    UnprovisionedBeacon {
        uuid: DeviceUuid,
        bearer: Bearer,
    },
    /// Provisioner: a device finished provisioning
    PeerProvisioned {
        uuid: DeviceUuid,
        unicast: UnicastAddr,
        element_count: u8,
        net_idx: KeyIndex,
    },
    /// Provisioner: provisioning of a device failed
    PeerFailed {
        uuid: DeviceUuid,
        reason: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedPeer {
    pub uuid: DeviceUuid,
    pub unicast: UnicastAddr,
    pub element_count: u8,
    pub net_idx: KeyIndex,
    pub name: String,
}

/// Work for the rest of the node resulting from a provisioning event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvAction {
    /// Node became operational; unlocks sending
    Ready {
        unicast: UnicastAddr,
        net_idx: KeyIndex,
        iv_index: u32,
        flags: u8,
    },
    /// Stop publish timers and drop pending transactions
    Teardown,
    AppKeyReady {
        net_idx: KeyIndex,
        app_idx: KeyIndex,
    },
    Bound(ModelBinding),
    /// Provisioner: hand this device to the stack for provisioning
    AddDevice { uuid: DeviceUuid, bearer: Bearer },
    /// Provisioner: start configuring this peer
    PeerReady(ProvisionedPeer),
}

/// Per-node provisioning state machine.
///
/// `Unprovisioned -> Provisioning -> Provisioned -> (Reset) -> Unprovisioned`
///
/// The provisioner variant provisions itself at startup (see
/// [`Provisioning::self_provision`]) and additionally filters unprovisioned
/// beacons through its [`UuidMatch`] policy.
pub struct Provisioning {
    state: ProvisioningState,
    identity: NodeIdentity,
    uuid_match: Option<UuidMatch>,
    ready_fired: bool,
    in_flight: HashSet<DeviceUuid>,
    peers: BTreeMap<UnicastAddr, ProvisionedPeer>,
}

impl Provisioning {
    pub fn node(uuid: DeviceUuid) -> Self {
        Self {
            state: ProvisioningState::Unprovisioned,
            identity: NodeIdentity::new(uuid),
            uuid_match: None,
            ready_fired: false,
            in_flight: HashSet::new(),
            peers: BTreeMap::new(),
        }
    }

    pub fn provisioner(uuid: DeviceUuid, uuid_match: UuidMatch) -> Self {
        Self {
            uuid_match: Some(uuid_match),
            ..Self::node(uuid)
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn is_provisioned(&self) -> bool {
        self.state == ProvisioningState::Provisioned
    }

    pub fn peers(&self) -> impl Iterator<Item = &ProvisionedPeer> {
        self.peers.values()
    }

    /// Provisioner assigns its own address and keys without a link
    pub fn self_provision(
        &mut self,
        unicast: UnicastAddr,
        net_idx: KeyIndex,
        app_idx: KeyIndex,
        key: AppKey,
    ) -> Result<Vec<ProvAction>, ProvisioningError> {
        let mut actions = self.handle(ProvEvent::Complete {
            net_idx,
            unicast,
            iv_index: 0,
            flags: 0,
        })?;
        actions.extend(self.handle(ProvEvent::AppKeyAdded { net_idx, app_idx, key })?);
        Ok(actions)
    }

    pub fn handle(&mut self, event: ProvEvent) -> Result<Vec<ProvAction>, ProvisioningError> {
        let mut actions = vec![];
        match event {
            ProvEvent::RegisterComplete { err } => {
                if err != 0 {
                    log::error!("Mesh stack registration failed, err {err}");
                    return Err(ProvisioningError::Register(err));
                }
                log::info!("Mesh stack registered");
            }
            ProvEvent::EnableComplete { err } => {
                if err != 0 {
                    log::error!("Provisioning enable failed, err {err}");
                    return Err(ProvisioningError::Enable(err));
                }
                log::info!("Provisioning enabled");
            }
            ProvEvent::LinkOpen(bearer) => {
                log::info!("Provisioning link opened on {bearer:?}");
                if self.state == ProvisioningState::Unprovisioned {
                    self.state = ProvisioningState::Provisioning;
                    self.ready_fired = false;
                }
            }
            ProvEvent::LinkClose(bearer) => {
                log::info!("Provisioning link closed on {bearer:?}");
                if self.state == ProvisioningState::Provisioning {
                    log::warn!("Link lost before provisioning completed, aborting");
                    self.state = ProvisioningState::Unprovisioned;
                }
            }
            ProvEvent::Complete {
                net_idx,
                unicast,
                iv_index,
                flags,
            } => {
                if self.ready_fired {
                    log::warn!("Duplicate provisioning complete for 0x{unicast:04x}, ignoring");
                    return Ok(actions);
                }
                if unicast == ADDR_UNASSIGNED {
                    log::error!("Provisioning complete carried the unassigned address");
                    return Err(ProvisioningError::UnassignedAddress);
                }
                self.identity.unicast = unicast;
                self.identity.net_idx = Some(net_idx);
                self.identity.iv_index = iv_index;
                self.identity.flags = flags;
                self.state = ProvisioningState::Provisioned;
                self.ready_fired = true;
                log::info!(
                    "Provisioned: addr 0x{unicast:04x} net_idx 0x{net_idx:04x} \
                    iv_index 0x{iv_index:08x} flags 0x{flags:02x}"
                );
                actions.push(ProvAction::Ready {
                    unicast,
                    net_idx,
                    iv_index,
                    flags,
                });
            }
            ProvEvent::Reset => {
                let was = self.state;
                if was == ProvisioningState::Unprovisioned && !self.identity.is_assigned() {
                    log::debug!("Reset while unprovisioned, nothing to do");
                    return Ok(actions);
                }
                self.identity.clear();
                self.state = ProvisioningState::Unprovisioned;
                self.ready_fired = false;
                self.in_flight.clear();
                self.peers.clear();
                log::info!("Node reset from {was:?}");
                if was == ProvisioningState::Provisioned {
                    actions.push(ProvAction::Teardown);
                }
            }
            ProvEvent::AppKeyAdded {
                net_idx,
                app_idx,
                key,
            } => {
                if self.identity.net_idx != Some(net_idx) {
                    log::warn!(
                        "AppKey 0x{app_idx:04x} for unknown net_idx 0x{net_idx:04x}, ignoring"
                    );
                    return Ok(actions);
                }
                self.identity.app_idx = Some(app_idx);
                self.identity.app_key = Some(key);
                log::info!("AppKey added: net_idx 0x{net_idx:04x} app_idx 0x{app_idx:04x}");
                actions.push(ProvAction::AppKeyReady { net_idx, app_idx });
            }
            ProvEvent::ModelBound { binding, app_idx } => {
                if self.identity.app_idx != Some(app_idx) {
                    log::warn!("Model bound to unknown app_idx 0x{app_idx:04x}, ignoring");
                    return Ok(actions);
                }
                log::info!(
                    "Model {:?} bound at elem 0x{:04x}",
                    binding.model,
                    binding.element
                );
                actions.push(ProvAction::Bound(binding));
            }
            ProvEvent::UnprovisionedBeacon { uuid, bearer } => {
                let Some(policy) = self.uuid_match.as_ref() else {
                    log::trace!("Ignoring beacon, not a provisioner");
                    return Ok(actions);
                };
                if !self.is_provisioned() {
                    log::debug!("Provisioner not ready, ignoring beacon");
                } else if !policy.matches(&uuid) {
                    log::debug!("Beacon {:02x?} does not match UUID policy", &uuid[..4]);
                } else if self.in_flight.contains(&uuid)
                    || self.peers.values().any(|p| p.uuid == uuid)
                {
                    log::trace!("Beacon from device already being handled");
                } else {
                    log::info!("Adding unprovisioned device {:02x?}", uuid);
                    self.in_flight.insert(uuid);
                    actions.push(ProvAction::AddDevice { uuid, bearer });
                }
            }
            ProvEvent::PeerProvisioned {
                uuid,
                unicast,
                element_count,
                net_idx,
            } => {
                self.in_flight.remove(&uuid);
                let peer = ProvisionedPeer {
                    uuid,
                    unicast,
                    element_count,
                    net_idx,
                    name: format!("NODE-{:02}", self.peers.len()),
                };
                log::info!(
                    "Peer {} provisioned at 0x{unicast:04x} with {element_count} element(s)",
                    peer.name
                );
                self.peers.insert(unicast, peer.clone());
                actions.push(ProvAction::PeerReady(peer));
            }
            ProvEvent::PeerFailed { uuid, reason } => {
                self.in_flight.remove(&uuid);
                log::error!("Provisioning of {:02x?} failed, reason {reason}", uuid);
            }
        }
        Ok(actions)
    }
}
