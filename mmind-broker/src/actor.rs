use actix::prelude::*;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    bridge::{BridgeAdapter, BridgeError, BridgeSession},
    config::Role,
    node::{MeshEvent, MeshNode, NodeError, NodeNotice},
    provisioning::{ProvisionedPeer, ProvisioningState},
    sensor_data::PropertyId,
    Tid, UnicastAddr,
};

/// How often pending transactions are checked for expired timeouts
pub const TIMEOUT_POLL_MS: u64 = 250;

/// A [`NodeNotice`] forwarded to a subscriber
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct Notify(pub NodeNotice);

/// Hosts one [`MeshNode`]: consumes the mesh event stream, runs the
/// timeout poll and, once provisioned, the publish timer.
pub struct NodeActor {
    node: MeshNode,
    events: Option<UnboundedReceiver<MeshEvent>>,
    startup: Vec<NodeNotice>,
    subscribers: Vec<Recipient<Notify>>,
    publish: Option<SpawnHandle>,
}

/// Start the node and host it on its own actor. Startup failures are
/// returned here rather than from inside the actor.
pub fn spawn_node(
    mut node: MeshNode,
    events: UnboundedReceiver<MeshEvent>,
) -> Result<Addr<NodeActor>, NodeError> {
    let startup = node.start()?;
    Ok(NodeActor {
        node,
        events: Some(events),
        startup,
        subscribers: vec![],
        publish: None,
    }
    .start())
}

/// Provisioner plus bridge: the node feeds readings to the bridge, the
/// bridge feeds control commands back
pub fn gateway(
    node: MeshNode,
    events: UnboundedReceiver<MeshEvent>,
    bridge: BridgeAdapter,
) -> Result<(Addr<NodeActor>, Addr<BridgeActor>), NodeError> {
    let node = spawn_node(node, events)?;
    let bridge = BridgeActor {
        bridge,
        node: node.clone(),
    }
    .start();
    node.do_send(Subscribe(bridge.clone().recipient()));
    Ok((node, bridge))
}

impl NodeActor {
    fn on_notices(&mut self, notices: Vec<NodeNotice>, ctx: &mut Context<Self>) {
        for notice in notices {
            match notice {
                NodeNotice::Ready { .. } => self.start_publishing(ctx),
                NodeNotice::Teardown => self.stop_publishing(ctx),
                _ => {}
            }
            for sub in self.subscribers.iter() {
                sub.do_send(Notify(notice.clone()));
            }
        }
    }

    fn start_publishing(&mut self, ctx: &mut Context<Self>) {
        if self.node.config().role == Role::Provisioner || self.publish.is_some() {
            return;
        }
        let interval = self.node.config().publish_interval();
        log::info!("Publishing every {interval:?}");
        self.publish = Some(ctx.run_interval(interval, |act, _ctx| act.node.publish_tick()));
    }

    fn stop_publishing(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.publish.take() {
            ctx.cancel_future(handle);
            log::info!("Publish timer stopped");
        }
    }
}

impl Actor for NodeActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(events) = self.events.take() {
            ctx.add_stream(UnboundedReceiverStream::new(events));
        }
        ctx.run_interval(Duration::from_millis(TIMEOUT_POLL_MS), |act, ctx| {
            let notices = act.node.tick(Instant::now());
            act.on_notices(notices, ctx);
        });
        let startup = std::mem::take(&mut self.startup);
        self.on_notices(startup, ctx);
    }
}

impl StreamHandler<MeshEvent> for NodeActor {
    fn handle(&mut self, event: MeshEvent, ctx: &mut Self::Context) {
        match self.node.handle_event(event) {
            Ok(notices) => self.on_notices(notices, ctx),
            Err(e) => {
                log::error!("Fatal mesh error {e:}, stopping node {}", self.node.config().name);
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        log::warn!("Mesh event stream closed");
        ctx.stop();
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Subscribe(pub Recipient<Notify>);

impl Handler<Subscribe> for NodeActor {
    type Result = ();

    fn handle(&mut self, msg: Subscribe, _ctx: &mut Self::Context) -> Self::Result {
        // late subscribers still learn the control target
        if let Some(target) = self.node.server_addr() {
            msg.0.do_send(Notify(NodeNotice::TargetKnown(target)));
        }
        self.subscribers.push(msg.0);
    }
}

#[derive(Message)]
#[rtype(result = "SendProbeResponse")]
pub struct SendProbe {
    /// Defaults to the last configured server
    pub target: Option<UnicastAddr>,
}
type SendProbeResponse = Result<Tid, NodeError>;

impl Handler<SendProbe> for NodeActor {
    type Result = SendProbeResponse;

    fn handle(&mut self, msg: SendProbe, _ctx: &mut Self::Context) -> Self::Result {
        self.node.send_probe(msg.target).map_err(|e| {
            log::error!("Unable to send probe {e:}");
            e
        })
    }
}

#[derive(Message)]
#[rtype(result = "ControlLedResponse")]
pub struct ControlLed {
    pub target: UnicastAddr,
    pub on: bool,
}
type ControlLedResponse = Result<(), NodeError>;

impl Handler<ControlLed> for NodeActor {
    type Result = ControlLedResponse;

    fn handle(&mut self, msg: ControlLed, _ctx: &mut Self::Context) -> Self::Result {
        self.node.send_led(msg.target, msg.on).map_err(|e| {
            log::error!("Unable to send LED control {e:}");
            e
        })
    }
}

#[derive(Message)]
#[rtype(result = "SensorGetResponse")]
pub struct SensorGet {
    pub target: Option<UnicastAddr>,
    /// Defaults to the property learned from the last descriptor
    pub property: Option<PropertyId>,
}
type SensorGetResponse = Result<(), NodeError>;

impl Handler<SensorGet> for NodeActor {
    type Result = SensorGetResponse;

    fn handle(&mut self, msg: SensorGet, _ctx: &mut Self::Context) -> Self::Result {
        let property = msg.property.or(self.node.recorded_property());
        self.node.sensor_get(msg.target, property).map_err(|e| {
            log::error!("Unable to send sensor get {e:}");
            e
        })
    }
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct ResetNode;

impl Handler<ResetNode> for NodeActor {
    type Result = ();

    fn handle(&mut self, _msg: ResetNode, ctx: &mut Self::Context) -> Self::Result {
        let notices = self.node.reset();
        self.on_notices(notices, ctx);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub name: String,
    pub role: Role,
    pub state: ProvisioningState,
    pub unicast: UnicastAddr,
    pub server_addr: Option<UnicastAddr>,
    pub peers: Vec<ProvisionedPeer>,
    pub pending: usize,
    pub last_tid: Tid,
    pub publishing: bool,
}

#[derive(Message)]
#[rtype(result = "GetNodeStatusResponse")]
pub struct GetNodeStatus;
type GetNodeStatusResponse = Result<NodeStatus, NodeError>;

impl Handler<GetNodeStatus> for NodeActor {
    type Result = GetNodeStatusResponse;

    fn handle(&mut self, _msg: GetNodeStatus, _ctx: &mut Self::Context) -> Self::Result {
        Ok(NodeStatus {
            name: self.node.config().name.clone(),
            role: self.node.config().role,
            state: self.node.state(),
            unicast: self.node.identity().unicast,
            server_addr: self.node.server_addr(),
            peers: self.node.peers(),
            pending: self.node.tracker().pending_count(),
            last_tid: self.node.tracker().last_tid(),
            publishing: self.publish.is_some(),
        })
    }
}

/// Events from the pub/sub client's own event loop
#[derive(Message, Debug, Clone, PartialEq, Eq)]
#[rtype(result = "()")]
pub enum PubSubEvent {
    Connecting,
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

/// Hosts the [`BridgeAdapter`] on its own mailbox, separate from the
/// mesh node
pub struct BridgeActor {
    bridge: BridgeAdapter,
    node: Addr<NodeActor>,
}

impl Actor for BridgeActor {
    type Context = Context<Self>;
}

impl Handler<Notify> for BridgeActor {
    type Result = ();

    fn handle(&mut self, msg: Notify, _ctx: &mut Self::Context) -> Self::Result {
        match msg.0 {
            NodeNotice::Reading { src, reading } => {
                self.bridge.on_reading(src, &reading).ok();
            }
            NodeNotice::TargetKnown(target) => self.bridge.set_target(Some(target)),
            NodeNotice::Teardown => self.bridge.set_target(None),
            other => log::trace!("Bridge ignoring {other:?}"),
        }
    }
}

impl Handler<PubSubEvent> for BridgeActor {
    type Result = ();

    fn handle(&mut self, msg: PubSubEvent, _ctx: &mut Self::Context) -> Self::Result {
        match msg {
            PubSubEvent::Connecting => self.bridge.on_connecting(),
            PubSubEvent::Connected => {
                self.bridge.on_connected().ok();
            }
            PubSubEvent::Disconnected => self.bridge.on_disconnected(),
            PubSubEvent::Message { topic, payload } => {
                if let Some((target, on)) = self.bridge.on_control(&topic, &payload) {
                    self.node.do_send(ControlLed { target, on });
                }
            }
        }
    }
}

#[derive(Message)]
#[rtype(result = "GetBridgeSessionResponse")]
pub struct GetBridgeSession;
type GetBridgeSessionResponse = Result<BridgeSession, BridgeError>;

impl Handler<GetBridgeSession> for BridgeActor {
    type Result = GetBridgeSessionResponse;

    fn handle(&mut self, _msg: GetBridgeSession, _ctx: &mut Self::Context) -> Self::Result {
        Ok(self.bridge.session().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::{BridgeRecord, Connectivity},
        config::{BridgeConfig, NodeConfig},
        loopback::{LoopbackMesh, RecordingPublisher},
        node::NodeParts,
        store::MemoryStore,
    };
    use mmind_sensor::{FixedSampler, Quantity, SimulatedLed};

    #[actix::test]
    async fn gateway_bridges_dht_readings() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mesh = LoopbackMesh::new();

        let pcfg = NodeConfig::provisioner();
        let (ptransport, pevents) = mesh.attach(pcfg.uuid, NodeParts::composition_for(&pcfg));
        let provisioner = MeshNode::new(
            pcfg,
            NodeParts::new(Box::new(ptransport), Box::new(MemoryStore::default())),
        )
        .unwrap();
        let publisher = RecordingPublisher::default();
        let bridge = BridgeAdapter::new(BridgeConfig::default(), Box::new(publisher.clone()));
        let (paddr, baddr) = gateway(provisioner, pevents, bridge).unwrap();

        let mut dcfg = NodeConfig::dht_server();
        dcfg.publish_interval_ms = 50;
        let (dtransport, devents) = mesh.attach(dcfg.uuid, NodeParts::composition_for(&dcfg));
        let led = SimulatedLed::new();
        let led_state = led.handle();
        let dht = MeshNode::new(
            dcfg,
            NodeParts::new(Box::new(dtransport), Box::new(MemoryStore::default()))
                .with_samplers(vec![
                    Box::new(FixedSampler {
                        quantity: Quantity::Temperature,
                        value: 21.5,
                    }),
                    Box::new(FixedSampler {
                        quantity: Quantity::Humidity,
                        value: 55.0,
                    }),
                ])
                .with_actuator(Box::new(led)),
        )
        .unwrap();
        let daddr = spawn_node(dht, devents).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        baddr.send(PubSubEvent::Connected).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let published = publisher.published();
        assert!(!published.is_empty());
        let record: BridgeRecord = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(record.temperature, Some(21.5));
        assert_eq!(record.humidity, Some(55.0));

        let session = baddr.send(GetBridgeSession).await.unwrap().unwrap();
        assert_eq!(session.connectivity, Connectivity::Connected);
        assert_eq!(session.target, Some(0x0005));

        let status = daddr.send(GetNodeStatus).await.unwrap().unwrap();
        assert_eq!(status.unicast, 0x0005);
        assert!(status.publishing);

        let tid = paddr.send(SendProbe { target: None }).await.unwrap().unwrap();
        assert_eq!(tid, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = paddr.send(GetNodeStatus).await.unwrap().unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.peers.len(), 1);

        baddr
            .send(PubSubEvent::Message {
                topic: BridgeConfig::default().control_topic,
                payload: b"1".to_vec(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(led_state.is_on());

        daddr.send(ResetNode).await.unwrap();
        let status = daddr.send(GetNodeStatus).await.unwrap().unwrap();
        assert!(!status.publishing);
        assert_eq!(status.state, ProvisioningState::Unprovisioned);
    }
}
