use std::{
    collections::{HashMap, VecDeque},
    time::Instant,
};
use thiserror::Error;
use tokio::time::Duration;

use crate::{
    composition::CompositionData,
    config::RetryPolicy,
    config_msg::{self, AppKeyAdd, ModelAppBind, STATUS_SUCCESS},
    opcode::{sig, Opcode, VendorOp},
    payload::{PayloadError, TypedPayload, VendorTid},
    sensor_data::PropertyId,
    transport::{AccessKey, MessageCtx, OutboundMessage},
    AppKey, CompanyId, KeyIndex, ModelBinding, ModelKey, Tid, UnicastAddr, ADDR_UNASSIGNED,
};

#[derive(Error, Debug, PartialEq)]
pub enum TrackerError {
    #[error("Target is the unassigned address")]
    UnassignedTarget,
    #[error("No network key yet, node not provisioned")]
    NotReady,
    #[error("No application key")]
    NoAppKey,
    #[error("Opcode {0} is not an acknowledged request")]
    Unacknowledged(Opcode),
    #[error("Configuration of 0x{0:04x} already in progress")]
    ConfigInProgress(UnicastAddr),
    #[error("{opcode} to 0x{target:04x} refused, wait queue is full")]
    QueueFull { target: UnicastAddr, opcode: Opcode },
    #[error("Payload Error")]
    Payload(#[from] PayloadError),
}

/// Steps of the per-peer configuration sequence, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStep {
    CompositionGet,
    AppKeyAdd,
    /// Index into the peer's bind list
    ModelAppBind(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFailure {
    /// Peer answered with a non-success status
    Status(u8),
    /// Response could not be parsed
    Malformed,
    /// Retries exhausted
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Request,
    Probe(Tid),
    Config(ConfigStep),
}

/// An acknowledged request awaiting its response
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub opcode: Opcode,
    pub target: UnicastAddr,
    pub tid: Option<Tid>,
    pub issued_at: Instant,
    pub retries: u32,
    pub timeout: Duration,
    pub payload: Vec<u8>,
    purpose: Purpose,
}

#[derive(Debug)]
struct QueuedRequest {
    opcode: Opcode,
    payload: Vec<u8>,
    timeout: Duration,
    purpose: Purpose,
}

#[derive(Debug)]
struct ConfigSequence {
    step: ConfigStep,
    binds: Vec<ModelBinding>,
}

#[derive(Debug, Clone, Copy)]
struct KeyContext {
    net_idx: KeyIndex,
    ttl: u8,
}

/// Something the application may want to act on after a tracker call
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Resolved {
        target: UnicastAddr,
        opcode: Opcode,
        payload: Vec<u8>,
    },
    ProbeEcho {
        target: UnicastAddr,
        tid: Tid,
        rtt: Duration,
    },
    TidAllocated(Tid),
    Composition {
        target: UnicastAddr,
        data: CompositionData,
    },
    ConfigStepDone {
        target: UnicastAddr,
        step: ConfigStep,
    },
    Configured {
        target: UnicastAddr,
        bound: Vec<ModelBinding>,
    },
    ConfigFailed {
        target: UnicastAddr,
        step: ConfigStep,
        reason: ConfigFailure,
    },
    Abandoned {
        target: UnicastAddr,
        opcode: Opcode,
        retries: u32,
    },
}

/// Messages to hand to the transport and events for the application
#[derive(Debug, Default)]
pub struct TrackerOutput {
    pub outbound: Vec<OutboundMessage>,
    pub events: Vec<TrackerEvent>,
}

impl TrackerOutput {
    fn merge(&mut self, other: TrackerOutput) {
        self.outbound.extend(other.outbound);
        self.events.extend(other.events);
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty()
    }
}

type TxKey = (UnicastAddr, Opcode);

/// Requests allowed to wait behind one pending transaction
pub const MAX_QUEUED: usize = 8;

/// Client request/response tracker.
///
/// Owns the pending transaction table. At most one transaction is pending
/// per `(target, family)` where the family is the acknowledging opcode;
/// further requests for the same key wait in FIFO order and are issued as
/// the pending one resolves or is abandoned. Each wait queue holds at most
/// [`MAX_QUEUED`] requests, beyond that `submit` refuses. Timeouts re-issue
/// the stored payload unchanged, so a vendor probe keeps its transaction id
/// across retries and the peer can deduplicate.
pub struct Tracker {
    company: CompanyId,
    policy: RetryPolicy,
    default_timeout: Duration,
    keys: Option<KeyContext>,
    app_key: Option<(KeyIndex, AppKey)>,
    bind_models: Vec<ModelKey>,
    pending: HashMap<TxKey, PendingTransaction>,
    queued: HashMap<TxKey, VecDeque<QueuedRequest>>,
    configs: HashMap<UnicastAddr, ConfigSequence>,
    last_tid: Tid,
}

impl Tracker {
    pub fn new(company: CompanyId, policy: RetryPolicy, default_timeout: Duration) -> Self {
        Self {
            company,
            policy,
            default_timeout,
            keys: None,
            app_key: None,
            bind_models: vec![ModelKey::vendor(company, ModelKey::VND_SERVER_ID)],
            pending: HashMap::new(),
            queued: HashMap::new(),
            configs: HashMap::new(),
            last_tid: 0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn set_keys(&mut self, net_idx: KeyIndex, ttl: u8) {
        self.keys = Some(KeyContext { net_idx, ttl });
    }

    pub fn set_app_key(&mut self, app_idx: KeyIndex, key: AppKey) {
        self.app_key = Some((app_idx, key));
    }

    /// Models bound on each configured peer, when present in its
    /// composition data
    pub fn set_bind_models(&mut self, models: Vec<ModelKey>) {
        self.bind_models = models;
    }

    /// Continue the tid sequence from persisted state
    pub fn restore_tid(&mut self, tid: Tid) {
        self.last_tid = tid;
    }

    pub fn last_tid(&self) -> Tid {
        self.last_tid
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, target: UnicastAddr, family: Opcode) -> Option<&PendingTransaction> {
        self.pending.get(&(target, family))
    }

    pub fn queued_count(&self, target: UnicastAddr, family: Opcode) -> usize {
        self.queued.get(&(target, family)).map_or(0, |q| q.len())
    }

    pub fn is_configuring(&self, target: UnicastAddr) -> bool {
        self.configs.contains_key(&target)
    }

    fn sender_for(&self, opcode: Opcode) -> ModelKey {
        if opcode.uses_device_key() {
            ModelKey::CONFIG_CLIENT
        } else if opcode.company().is_some() {
            ModelKey::vendor(self.company, ModelKey::VND_CLIENT_ID)
        } else {
            ModelKey::SENSOR_CLIENT
        }
    }

    fn outbound(
        &self,
        target: UnicastAddr,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<OutboundMessage, TrackerError> {
        let keys = self.keys.ok_or(TrackerError::NotReady)?;
        let key = if opcode.uses_device_key() {
            AccessKey::Device
        } else {
            AccessKey::App(self.app_key.as_ref().ok_or(TrackerError::NoAppKey)?.0)
        };
        Ok(OutboundMessage {
            ctx: MessageCtx {
                net_idx: keys.net_idx,
                key,
                dst: target,
                ttl: keys.ttl,
            },
            sender: self.sender_for(opcode),
            opcode,
            payload: payload.to_vec(),
        })
    }

    /// Issue an acknowledged request. Fails without creating a
    /// transaction when the target is unassigned or keys are missing.
    pub fn send_request(
        &mut self,
        target: UnicastAddr,
        opcode: Opcode,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<TrackerOutput, TrackerError> {
        self.submit(target, opcode, payload, timeout, Purpose::Request)
    }

    fn submit(
        &mut self,
        target: UnicastAddr,
        opcode: Opcode,
        payload: Vec<u8>,
        timeout: Duration,
        purpose: Purpose,
    ) -> Result<TrackerOutput, TrackerError> {
        if target == ADDR_UNASSIGNED {
            log::error!("Refusing to send {opcode} to the unassigned address");
            return Err(TrackerError::UnassignedTarget);
        }
        let family = opcode.response().ok_or(TrackerError::Unacknowledged(opcode))?;
        // validates keys before anything is recorded
        let msg = self.outbound(target, opcode, &payload)?;

        let key = (target, family);
        let mut out = TrackerOutput::default();
        if self.pending.contains_key(&key) {
            let queue = self.queued.entry(key).or_default();
            if queue.len() >= MAX_QUEUED {
                log::warn!("{opcode} to 0x{target:04x} dropped, queue is full");
                return Err(TrackerError::QueueFull { target, opcode });
            }
            queue.push_back(QueuedRequest {
                opcode,
                payload,
                timeout,
                purpose,
            });
            log::info!(
                "{opcode} to 0x{target:04x} queued behind pending transaction ({} waiting)",
                queue.len()
            );
            return Ok(out);
        }

        log::info!("Send {opcode} to 0x{target:04x}");
        self.pending.insert(
            key,
            PendingTransaction {
                opcode,
                target,
                tid: match purpose {
                    Purpose::Probe(tid) => Some(tid),
                    _ => None,
                },
                issued_at: Instant::now(),
                retries: 0,
                timeout,
                payload,
                purpose,
            },
        );
        out.outbound.push(msg);
        Ok(out)
    }

    /// Unacknowledged message such as LED_CTRL. Nothing is tracked, but
    /// the same address and key checks apply.
    pub fn unacknowledged(
        &self,
        target: UnicastAddr,
        opcode: Opcode,
        payload: Vec<u8>,
    ) -> Result<OutboundMessage, TrackerError> {
        if target == ADDR_UNASSIGNED {
            log::error!("Refusing to send {opcode} to the unassigned address");
            return Err(TrackerError::UnassignedTarget);
        }
        log::info!("Send {opcode} to 0x{target:04x}");
        self.outbound(target, opcode, &payload)
    }

    /// Vendor SEND probe with a freshly allocated transaction id
    pub fn send_probe(&mut self, target: UnicastAddr) -> Result<(Tid, TrackerOutput), TrackerError> {
        let tid = self.last_tid.wrapping_add(1);
        let mut out = self.submit(
            target,
            VendorOp::Send.opcode(self.company),
            VendorTid(tid).encode(),
            self.default_timeout,
            Purpose::Probe(tid),
        )?;
        self.last_tid = tid;
        out.events.push(TrackerEvent::TidAllocated(tid));
        Ok((tid, out))
    }

    /// Sensor Get, optionally scoped to one property
    pub fn sensor_get(
        &mut self,
        target: UnicastAddr,
        property: Option<PropertyId>,
    ) -> Result<TrackerOutput, TrackerError> {
        let payload = property.map(|p| p.to_le_bytes().to_vec()).unwrap_or_default();
        self.send_request(target, sig::SENSOR_GET, payload, self.default_timeout)
    }

    pub fn descriptor_get(
        &mut self,
        target: UnicastAddr,
        property: Option<PropertyId>,
    ) -> Result<TrackerOutput, TrackerError> {
        let payload = property.map(|p| p.to_le_bytes().to_vec()).unwrap_or_default();
        self.send_request(target, sig::SENSOR_DESCRIPTOR_GET, payload, self.default_timeout)
    }

    /// Begin Composition Data Get -> AppKey Add -> Model App Bind xN for
    /// a freshly provisioned peer
    pub fn start_configuration(&mut self, target: UnicastAddr) -> Result<TrackerOutput, TrackerError> {
        if self.configs.contains_key(&target) {
            return Err(TrackerError::ConfigInProgress(target));
        }
        if self.app_key.is_none() {
            log::error!("Cannot configure 0x{target:04x} without an application key");
            return Err(TrackerError::NoAppKey);
        }
        let out = self.submit(
            target,
            sig::COMPOSITION_DATA_GET,
            vec![0x00],
            self.default_timeout,
            Purpose::Config(ConfigStep::CompositionGet),
        )?;
        log::info!("Configuring 0x{target:04x}: Composition Data Get");
        self.configs.insert(
            target,
            ConfigSequence {
                step: ConfigStep::CompositionGet,
                binds: vec![],
            },
        );
        Ok(out)
    }

    /// Match a response to its pending transaction. Unsolicited responses
    /// are logged and produce no output.
    pub fn on_response(&mut self, opcode: Opcode, source: UnicastAddr, payload: &[u8]) -> TrackerOutput {
        let key = (source, opcode);
        let mut out = TrackerOutput::default();

        let Some(tx) = self.pending.get(&key) else {
            log::debug!("No pending transaction for {opcode} from 0x{source:04x}");
            return out;
        };

        if let Purpose::Probe(tid) = tx.purpose {
            match VendorTid::decode(payload) {
                Ok(VendorTid(got)) if got == tid => {}
                Ok(VendorTid(got)) => {
                    log::warn!(
                        "Echo from 0x{source:04x} carries tid 0x{got:04x}, \
                        waiting for 0x{tid:04x}"
                    );
                    return out;
                }
                Err(e) => {
                    log::warn!("Malformed echo from 0x{source:04x}: {e:}");
                    return out;
                }
            }
        }

        let Some(tx) = self.pending.remove(&key) else {
            return out;
        };
        log::info!("Recv {opcode} from 0x{source:04x} after {} retries", tx.retries);

        match tx.purpose {
            Purpose::Request => out.events.push(TrackerEvent::Resolved {
                target: source,
                opcode,
                payload: payload.to_vec(),
            }),
            Purpose::Probe(tid) => {
                let rtt = tx.issued_at.elapsed();
                log::info!("Probe 0x{tid:04x} to 0x{source:04x} echoed in {rtt:?}");
                out.events.push(TrackerEvent::ProbeEcho {
                    target: source,
                    tid,
                    rtt,
                });
            }
            Purpose::Config(step) => out.merge(self.advance_config(source, step, payload)),
        }

        out.merge(self.promote(key));
        out
    }

    fn fail_config(&mut self, target: UnicastAddr, step: ConfigStep, reason: ConfigFailure) -> TrackerOutput {
        log::error!("Configuration of 0x{target:04x} failed at {step:?}: {reason:?}");
        self.configs.remove(&target);
        TrackerOutput {
            outbound: vec![],
            events: vec![TrackerEvent::ConfigFailed {
                target,
                step,
                reason,
            }],
        }
    }

    fn advance_config(&mut self, target: UnicastAddr, step: ConfigStep, payload: &[u8]) -> TrackerOutput {
        if !self.configs.contains_key(&target) {
            log::warn!("Config response from 0x{target:04x} without an active sequence");
            return TrackerOutput::default();
        }

        let mut out = TrackerOutput::default();
        let next = match step {
            ConfigStep::CompositionGet => {
                let data = match CompositionData::parse_status(payload) {
                    Ok(d) => d,
                    Err(e) => {
                        log::error!("Bad composition data from 0x{target:04x}: {e:}");
                        return self.fail_config(target, step, ConfigFailure::Malformed);
                    }
                };
                let mut binds: Vec<ModelBinding> = data
                    .models_matching(target, &self.bind_models)
                    .into_iter()
                    .map(|(element, model)| ModelBinding { model, element })
                    .collect();
                if binds.is_empty() {
                    log::warn!(
                        "0x{target:04x} lists none of the expected models, binding the vendor server"
                    );
                    binds.push(ModelBinding {
                        model: ModelKey::vendor(self.company, ModelKey::VND_SERVER_ID),
                        element: target,
                    });
                }
                if let Some(seq) = self.configs.get_mut(&target) {
                    seq.binds = binds;
                }
                out.events.push(TrackerEvent::Composition { target, data });
                ConfigStep::AppKeyAdd
            }
            ConfigStep::AppKeyAdd | ConfigStep::ModelAppBind(_) => {
                match config_msg::status_code(payload) {
                    Ok(STATUS_SUCCESS) => {}
                    Ok(status) => return self.fail_config(target, step, ConfigFailure::Status(status)),
                    Err(_) => return self.fail_config(target, step, ConfigFailure::Malformed),
                }
                match step {
                    ConfigStep::ModelAppBind(i) => ConfigStep::ModelAppBind(i + 1),
                    _ => ConfigStep::ModelAppBind(0),
                }
            }
        };
        out.events.push(TrackerEvent::ConfigStepDone { target, step });

        let (opcode, body) = match next {
            ConfigStep::AppKeyAdd => {
                let Some((app_idx, key)) = self.app_key else {
                    return self.fail_config(target, next, ConfigFailure::Abandoned);
                };
                let net_idx = self.keys.map(|k| k.net_idx).unwrap_or_default();
                (
                    sig::APP_KEY_ADD,
                    AppKeyAdd {
                        net_idx,
                        app_idx,
                        key,
                    }
                    .encode(),
                )
            }
            ConfigStep::ModelAppBind(i) => {
                let binding = self.configs.get(&target).and_then(|s| s.binds.get(i)).copied();
                let (Some(binding), Some((app_idx, _))) = (binding, self.app_key) else {
                    let bound = self
                        .configs
                        .remove(&target)
                        .map(|s| s.binds)
                        .unwrap_or_default();
                    log::info!("0x{target:04x} configured, {} model(s) bound", bound.len());
                    out.events.push(TrackerEvent::Configured { target, bound });
                    return out;
                };
                (sig::MODEL_APP_BIND, ModelAppBind { binding, app_idx }.encode())
            }
            ConfigStep::CompositionGet => return out,
        };

        log::info!("Configuring 0x{target:04x}: {next:?}");
        match self.submit(target, opcode, body, self.default_timeout, Purpose::Config(next)) {
            Ok(o) => {
                if let Some(seq) = self.configs.get_mut(&target) {
                    seq.step = next;
                }
                out.merge(o);
                out
            }
            Err(e) => {
                log::error!("Unable to issue {next:?} to 0x{target:04x}: {e:}");
                let failed = self.fail_config(target, next, ConfigFailure::Abandoned);
                out.merge(failed);
                out
            }
        }
    }

    /// Issue the next request waiting on a key that just freed up
    fn promote(&mut self, key: TxKey) -> TrackerOutput {
        let mut out = TrackerOutput::default();
        while !self.pending.contains_key(&key) {
            let Some(next) = self.queued.get_mut(&key).and_then(|q| q.pop_front()) else {
                break;
            };
            match self.submit(key.0, next.opcode, next.payload, next.timeout, next.purpose) {
                Ok(o) => out.merge(o),
                Err(e) => log::error!("Dropping queued {} to 0x{:04x}: {e:}", next.opcode, key.0),
            }
        }
        if self.queued.get(&key).is_some_and(|q| q.is_empty()) {
            self.queued.remove(&key);
        }
        out
    }

    /// Escalate one transaction whose timeout fired: re-issue it unchanged
    /// while the retry policy allows, abandon it otherwise
    pub fn on_timeout(&mut self, target: UnicastAddr, family: Opcode, now: Instant) -> TrackerOutput {
        let key = (target, family);
        let mut out = TrackerOutput::default();
        let policy = self.policy;

        let Some(tx) = self.pending.get_mut(&key) else {
            return out;
        };
        log::warn!("{} to 0x{target:04x} timed out (retry {})", tx.opcode, tx.retries);

        if policy.allows(tx.retries) {
            tx.retries += 1;
            tx.issued_at = now;
            let (opcode, payload) = (tx.opcode, tx.payload.clone());
            match self.outbound(target, opcode, &payload) {
                Ok(msg) => {
                    log::info!("Resend {opcode} to 0x{target:04x}");
                    out.outbound.push(msg);
                    return out;
                }
                Err(e) => log::error!("Unable to resend {opcode}: {e:}"),
            }
        }

        let Some(tx) = self.pending.remove(&key) else {
            return out;
        };
        log::error!(
            "Abandoning {} to 0x{target:04x} after {} retries",
            tx.opcode,
            tx.retries
        );
        out.events.push(TrackerEvent::Abandoned {
            target,
            opcode: tx.opcode,
            retries: tx.retries,
        });
        if let Purpose::Config(step) = tx.purpose {
            out.merge(self.fail_config(target, step, ConfigFailure::Abandoned));
        }
        out.merge(self.promote(key));
        out
    }

    /// Fire every timeout due at `now`
    pub fn poll_timeouts(&mut self, now: Instant) -> TrackerOutput {
        let mut expired: Vec<TxKey> = self
            .pending
            .iter()
            .filter(|(_, tx)| now.saturating_duration_since(tx.issued_at) >= tx.timeout)
            .map(|(k, _)| *k)
            .collect();
        expired.sort();

        let mut out = TrackerOutput::default();
        for (target, family) in expired {
            out.merge(self.on_timeout(target, family, now));
        }
        out
    }

    /// Drop every pending, queued and in-progress item. Used on node reset.
    pub fn reset(&mut self) -> usize {
        let dropped = self.pending.len() + self.queued.values().map(|q| q.len()).sum::<usize>();
        self.pending.clear();
        self.queued.clear();
        self.configs.clear();
        self.keys = None;
        self.app_key = None;
        if dropped > 0 {
            log::info!("Dropped {dropped} outstanding request(s)");
        }
        dropped
    }
}
