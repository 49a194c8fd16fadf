use mmind_broker::{
    config::{BridgeConfig, NodeConfig},
    loopback::{LogPublisher, LoopbackMesh},
    spawn_node, BridgeAdapter, GetNodeStatus, MemoryStore, MeshNode, NodeParts, PubSubEvent,
    SendProbe,
};

#[actix::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    log::info!("Initializing loopback mesh");
    let mesh = LoopbackMesh::new();

    let pcfg = NodeConfig::provisioner();
    let (transport, events) = mesh.attach(pcfg.uuid, NodeParts::composition_for(&pcfg));
    let parts = NodeParts::simulated(&pcfg, Box::new(transport), Box::new(MemoryStore::default()))?;
    let provisioner = MeshNode::new(pcfg, parts)?;
    let bridge = BridgeAdapter::new(BridgeConfig::default(), Box::new(LogPublisher));
    let (gateway, bridge) = mmind_broker::gateway(provisioner, events, bridge).map_err(|e| {
        log::error!("Error starting gateway {e:}");
        e
    })?;

    let dcfg = NodeConfig::dht_server();
    let (transport, events) = mesh.attach(dcfg.uuid, NodeParts::composition_for(&dcfg));
    let parts = NodeParts::simulated(&dcfg, Box::new(transport), Box::new(MemoryStore::default()))?;
    let server = spawn_node(MeshNode::new(dcfg, parts)?, events).map_err(|e| {
        log::error!("Error starting dht server {e:}");
        e
    })?;

    bridge.do_send(PubSubEvent::Connecting);
    tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    bridge.do_send(PubSubEvent::Connected);

    let mut tick = tokio::time::interval(tokio::time::Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                match gateway.send(SendProbe { target: None }).await? {
                    Ok(tid) => log::info!("Probe tid {tid} sent"),
                    Err(e) => log::warn!("Probe not sent {e:}"),
                }
                let status = server.send(GetNodeStatus).await??;
                log::info!("Server {:?} at 0x{:04x}", status.state, status.unicast);
            }
        }
    }

    Ok(())
}
