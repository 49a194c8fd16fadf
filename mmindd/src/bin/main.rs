use mmind_broker::{PubSubEvent, SendProbe};
use mmindd::{deployment, DaemonConfig, MeshMinderError, MeshMinderResult};
use tracing_appender::rolling;
use tracing_subscriber::FmtSubscriber;

use tracing_log::LogTracer;

#[actix::main]
async fn main() -> MeshMinderResult<()> {
    let cfg = DaemonConfig::load()?;

    LogTracer::init().map_err(|e| MeshMinderError::Logging(e.to_string()))?;

    let log = rolling::daily(&cfg.log_dir, "mmindd.log");
    let (nb, _guard) = tracing_appender::non_blocking(log);

    let sub = FmtSubscriber::builder()
        .with_max_level(cfg.level())
        .with_writer(nb)
        .finish();

    tracing::subscriber::set_global_default(sub)
        .map_err(|e| MeshMinderError::Logging(e.to_string()))?;

    let deployment = deployment::launch(&cfg)?;

    // Stand-in for the MQTT client's own connect sequence
    deployment.bridge.do_send(PubSubEvent::Connecting);
    tokio::time::sleep(cfg.connect_delay()).await;
    deployment.bridge.do_send(PubSubEvent::Connected);

    let mut probe = tokio::time::interval(cfg.probe_interval());
    let mut status = tokio::time::interval(cfg.status_interval());
    let mut led_on = false;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Interrupted, shutting down");
                break;
            }
            _ = probe.tick() => {
                match deployment.gateway.send(SendProbe { target: None }).await? {
                    Ok(tid) => log::info!("Probe sent with tid {tid}"),
                    Err(e) => log::warn!("Probe not sent {e:}"),
                }
                led_on = !led_on;
                deployment.bridge.do_send(PubSubEvent::Message {
                    topic: cfg.bridge.control_topic.clone(),
                    payload: if led_on { b"1".to_vec() } else { b"0".to_vec() },
                });
            }
            _ = status.tick() => {
                for s in deployment.report().await? {
                    log::info!(
                        "{} ({:?}) {:?} at 0x{:04x}, {} peers, {} pending, publishing: {}",
                        s.name,
                        s.role,
                        s.state,
                        s.unicast,
                        s.peers.len(),
                        s.pending,
                        s.publishing
                    );
                }
            }
        }
    }

    Ok(())
}
