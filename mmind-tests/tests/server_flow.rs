use mmind_broker::{
    config::NodeConfig, loopback::ScriptedTransport, DhtReading, InboundMessage, LedControl,
    MemoryStore, MeshEvent, MeshNode, ModelBinding, ModelKey, NodeNotice, NodeParts, ProvEvent,
    ProvisioningState, TypedPayload, VendorOp, VendorTid, ADDR_ALL_NODES,
};
use mmind_sensor::{FixedSampler, LedHandle, Quantity, SimulatedLed};

const PROVISIONER: u16 = 0x0001;
const OWN: u16 = 0x0005;

/// DHT server taken through provisioning, key delivery and vendor model bind
fn dht_server() -> (MeshNode, ScriptedTransport, LedHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = NodeConfig::dht_server();
    let cid = cfg.company_id;
    let transport = ScriptedTransport::default();
    let led = SimulatedLed::new();
    let handle = led.handle();
    let mut node = MeshNode::new(
        cfg,
        NodeParts::new(Box::new(transport.clone()), Box::new(MemoryStore::default()))
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
    node.start().unwrap();

    for ev in [
        ProvEvent::LinkOpen(mmind_broker::Bearer::Adv),
        ProvEvent::Complete {
            net_idx: 0,
            unicast: OWN,
            iv_index: 0,
            flags: 0,
        },
        ProvEvent::AppKeyAdded {
            net_idx: 0,
            app_idx: 0,
            key: [0x12; 16],
        },
        ProvEvent::ModelBound {
            binding: ModelBinding {
                model: ModelKey::vendor(cid, ModelKey::VND_SERVER_ID),
                element: OWN,
            },
            app_idx: 0,
        },
    ] {
        node.handle_event(MeshEvent::Provisioning(ev)).unwrap();
    }
    assert_eq!(node.state(), ProvisioningState::Provisioned);
    (node, transport, handle)
}

fn request(node: &MeshNode, op: VendorOp, payload: Vec<u8>) -> MeshEvent {
    MeshEvent::Message(InboundMessage {
        src: PROVISIONER,
        dst: OWN,
        opcode: op.opcode(node.config().company_id),
        payload,
    })
}

#[test]
fn echoes_probe_with_same_tid() {
    let (mut node, transport, _led) = dht_server();
    let ev = request(&node, VendorOp::Send, VendorTid(0x0007).encode());
    node.handle_event(ev).unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ctx.dst, PROVISIONER);
    assert_eq!(sent[0].opcode, VendorOp::Status.opcode(node.config().company_id));
    assert_eq!(VendorTid::decode(&sent[0].payload), Ok(VendorTid(0x0007)));
}

#[test]
fn led_control_length_guard() {
    let (mut node, transport, led) = dht_server();
    let valid = LedControl {
        on: true,
        timestamp: 42,
    }
    .encode();

    for len in 0..=255usize {
        if len == LedControl::WIRE_LEN {
            continue;
        }
        let mut payload = valid.clone();
        payload.resize(len, 0x01);
        let ev = request(&node, VendorOp::LedCtrl, payload);
        assert!(node.handle_event(ev).unwrap().is_empty());
        assert!(!led.is_on(), "LED switched by a {len} octet payload");
    }
    // bad format id with the right length
    let mut wrong_format = valid.clone();
    wrong_format[0] = 0x7F;
    let ev = request(&node, VendorOp::LedCtrl, wrong_format);
    node.handle_event(ev).unwrap();
    assert!(!led.is_on());

    let ev = request(&node, VendorOp::LedCtrl, valid);
    node.handle_event(ev).unwrap();
    assert!(led.is_on());
    assert!(transport.sent().is_empty());
}

#[test]
fn short_probe_is_dropped() {
    let (mut node, transport, _led) = dht_server();
    for payload in [vec![], vec![0x07], vec![0x07, 0x00, 0x00]] {
        let ev = request(&node, VendorOp::Send, payload);
        node.handle_event(ev).unwrap();
    }
    assert!(transport.sent().is_empty());
}

#[test]
fn publishes_to_peer_and_all_nodes() {
    let (mut node, transport, _led) = dht_server();
    node.publish_tick();

    let sent = transport.sent();
    let dsts: Vec<_> = sent.iter().map(|m| m.ctx.dst).collect();
    assert_eq!(dsts, vec![PROVISIONER, ADDR_ALL_NODES]);
    let reading = DhtReading::decode(&sent[0].payload).unwrap();
    assert_eq!(reading.temperature, 21.5);
    assert_eq!(reading.humidity, 55.0);
}

#[test]
fn broadcast_survives_failed_unicast() {
    let (mut node, transport, _led) = dht_server();
    transport.fail_destination(PROVISIONER);
    node.publish_tick();
    node.publish_tick();

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.ctx.dst == ADDR_ALL_NODES));
}

#[test]
fn unicast_survives_failed_broadcast() {
    let (mut node, transport, _led) = dht_server();
    transport.fail_destination(ADDR_ALL_NODES);
    node.publish_tick();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ctx.dst, PROVISIONER);
}

#[test]
fn reset_is_idempotent() {
    let (mut node, transport, _led) = dht_server();
    assert_eq!(node.reset(), vec![NodeNotice::Teardown]);
    assert!(node.reset().is_empty());
    assert_eq!(node.state(), ProvisioningState::Unprovisioned);

    node.publish_tick();
    let ev = request(&node, VendorOp::Send, VendorTid(1).encode());
    node.handle_event(ev).unwrap();
    assert!(transport.sent().is_empty());
}
