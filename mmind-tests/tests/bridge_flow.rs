use mmind_broker::{
    config::{BridgeConfig, NodeConfig},
    loopback::{RecordingPublisher, ScriptedTransport},
    BridgeAdapter, BridgeRecord, Connectivity, DhtReading, InboundMessage, LedControl,
    MemoryStore, MeshEvent, MeshNode, NodeNotice, NodeParts, ProvEvent, TypedPayload, VendorOp,
};

const SERVER: u16 = 0x0005;

struct Gateway {
    node: MeshNode,
    transport: ScriptedTransport,
    bridge: BridgeAdapter,
    publisher: RecordingPublisher,
}

impl Gateway {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = ScriptedTransport::default();
        let mut node = MeshNode::new(
            NodeConfig::provisioner(),
            NodeParts::new(Box::new(transport.clone()), Box::new(MemoryStore::default())),
        )
        .unwrap();
        node.start().unwrap();
        let publisher = RecordingPublisher::default();
        let bridge = BridgeAdapter::new(BridgeConfig::default(), Box::new(publisher.clone()));
        Self {
            node,
            transport,
            bridge,
            publisher,
        }
    }

    /// Feed a mesh event and hand whatever it yields to the bridge
    fn event(&mut self, ev: MeshEvent) {
        for notice in self.node.handle_event(ev).unwrap() {
            match notice {
                NodeNotice::Reading { src, reading } => {
                    self.bridge.on_reading(src, &reading).unwrap();
                }
                NodeNotice::TargetKnown(target) => self.bridge.set_target(Some(target)),
                NodeNotice::Teardown => self.bridge.set_target(None),
                _ => {}
            }
        }
    }

    fn dht(&mut self, temperature: f32, humidity: f32) {
        let opcode = VendorOp::DhtData.opcode(self.node.config().company_id);
        self.event(MeshEvent::Message(InboundMessage {
            src: SERVER,
            dst: 0x0001,
            opcode,
            payload: DhtReading {
                temperature,
                humidity,
                timestamp: 0,
            }
            .encode(),
        }));
    }

    fn records(&self) -> Vec<BridgeRecord> {
        self.publisher
            .published()
            .iter()
            .map(|(_, p)| serde_json::from_slice(p).unwrap())
            .collect()
    }
}

#[test]
fn catch_up_after_connect() {
    let mut gw = Gateway::new();
    gw.dht(21.5, 55.0);
    gw.bridge.on_connecting();
    assert!(gw.publisher.published().is_empty());

    gw.bridge.on_connected().unwrap();
    let records = gw.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].temperature, Some(21.5));
    assert_eq!(records[0].humidity, Some(55.0));
    assert_eq!(records[0].source, Some(SERVER));

    gw.dht(22.0, 50.0);
    assert_eq!(gw.records().len(), 2);
}

#[test]
fn malformed_reading_never_reaches_bridge() {
    let mut gw = Gateway::new();
    gw.bridge.on_connected().unwrap();
    let opcode = VendorOp::DhtData.opcode(gw.node.config().company_id);
    gw.event(MeshEvent::Message(InboundMessage {
        src: SERVER,
        dst: 0x0001,
        opcode,
        payload: vec![0x01, 0x00, 0x00],
    }));
    assert!(gw.publisher.published().is_empty());
    assert!(gw.bridge.session().latest.is_empty());
}

#[test]
fn disconnect_suppresses_publish() {
    let mut gw = Gateway::new();
    gw.bridge.on_connected().unwrap();
    gw.dht(20.0, 40.0);
    gw.bridge.on_disconnected();
    assert_eq!(gw.bridge.connectivity(), Connectivity::Disconnected);
    assert!(gw.bridge.session().subscriptions.is_empty());

    gw.dht(25.0, 45.0);
    assert_eq!(gw.records().len(), 1);

    gw.bridge.on_connected().unwrap();
    let records = gw.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].temperature, Some(25.0));
}

#[test]
fn control_message_becomes_led_command() {
    let mut gw = Gateway::new();
    let topic = gw.bridge.config().control_topic.clone();
    assert_eq!(gw.bridge.on_control(&topic, b"1"), None);

    gw.event(MeshEvent::Provisioning(ProvEvent::PeerProvisioned {
        uuid: NodeConfig::dht_server().uuid,
        unicast: SERVER,
        element_count: 1,
        net_idx: 0,
    }));
    let (target, on) = gw.bridge.on_control(&topic, b"1").unwrap();
    assert_eq!(target, SERVER);
    gw.node.send_led(target, on).unwrap();

    let led = gw.transport.sent().into_iter().last().unwrap();
    assert_eq!(led.ctx.dst, SERVER);
    assert_eq!(led.opcode, VendorOp::LedCtrl.opcode(gw.node.config().company_id));
    assert!(LedControl::decode(&led.payload).unwrap().on);
    // only the Composition Data Get started by provisioning is tracked
    assert_eq!(gw.node.tracker().pending_count(), 1);
}
