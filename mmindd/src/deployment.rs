use actix::Addr;
use futures::future::join_all;
use mmind_broker::{
    config::NodeConfig,
    gateway,
    loopback::{LogPublisher, LoopbackMesh},
    spawn_node, BridgeActor, BridgeAdapter, GetNodeStatus, JsonFileStore, MemoryStore, MeshEvent,
    MeshNode, NodeActor, NodeParts, NodeStatus, StateStore,
};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{DaemonConfig, MeshMinderResult};

/// Every node of a simulated deployment, attached to one loopback mesh
pub struct Deployment {
    pub mesh: LoopbackMesh,
    pub gateway: Addr<NodeActor>,
    pub bridge: Addr<BridgeActor>,
    pub servers: Vec<Addr<NodeActor>>,
}

fn build_node(
    mesh: &LoopbackMesh,
    cfg: &NodeConfig,
    store: Box<dyn StateStore>,
) -> MeshMinderResult<(MeshNode, UnboundedReceiver<MeshEvent>)> {
    let (transport, events) = mesh.attach(cfg.uuid, NodeParts::composition_for(cfg));
    let parts = NodeParts::simulated(cfg, Box::new(transport), store)?;
    Ok((MeshNode::new(cfg.clone(), parts)?, events))
}

/// Start the provisioner and bridge first so it is scanning by the time
/// the servers begin to beacon
pub fn launch(cfg: &DaemonConfig) -> MeshMinderResult<Deployment> {
    let mesh = LoopbackMesh::new();

    let (provisioner, events) = build_node(
        &mesh,
        &cfg.provisioner,
        Box::new(JsonFileStore::new(&cfg.state_path)),
    )?;
    let bridge = BridgeAdapter::new(cfg.bridge.clone(), Box::new(LogPublisher));
    let (gateway, bridge) = gateway(provisioner, events, bridge).map_err(|e| {
        log::error!("Error starting gateway {e:}");
        e
    })?;
    log::info!("Gateway {} started", cfg.provisioner.name);

    let mut servers = vec![];
    for server in cfg.servers.iter() {
        let (node, events) = build_node(&mesh, server, Box::new(MemoryStore::default()))?;
        servers.push(spawn_node(node, events).map_err(|e| {
            log::error!("Error starting {} {e:}", server.name);
            e
        })?);
        log::info!("Server {} started", server.name);
    }

    Ok(Deployment {
        mesh,
        gateway,
        bridge,
        servers,
    })
}

impl Deployment {
    /// Status of the gateway followed by every server
    pub async fn report(&self) -> MeshMinderResult<Vec<NodeStatus>> {
        let requests = std::iter::once(&self.gateway)
            .chain(self.servers.iter())
            .map(|addr| addr.send(GetNodeStatus));
        let mut statuses = vec![];
        for res in join_all(requests).await {
            statuses.push(res??);
        }
        Ok(statuses)
    }
}
