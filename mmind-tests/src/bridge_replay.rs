use mmind_broker::{
    config::BridgeConfig, loopback::RecordingPublisher, BridgeAdapter, BridgeRecord, DhtReading,
    LdrReading, Reading,
};

/// Feeds a fixed reading sequence through the bridge across a disconnect
/// and dumps every record that reached the pub/sub side
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let publisher = RecordingPublisher::default();
    let mut bridge = BridgeAdapter::new(BridgeConfig::default(), Box::new(publisher.clone()));
    bridge.set_target(Some(0x0005));

    bridge.on_reading(
        0x0005,
        &Reading::Dht(DhtReading {
            temperature: 21.5,
            humidity: 55.0,
            timestamp: 0,
        }),
    )?;
    bridge.on_connecting();
    bridge.on_connected()?;

    bridge.on_reading(0x0006, &Reading::Ldr(LdrReading::from_level(1200, 10)))?;
    bridge.on_disconnected();
    bridge.on_reading(
        0x0005,
        &Reading::Dht(DhtReading {
            temperature: 22.0,
            humidity: 54.0,
            timestamp: 20,
        }),
    )?;
    bridge.on_connected()?;

    let control = bridge.config().control_topic.clone();
    if let Some((target, on)) = bridge.on_control(&control, b"1") {
        log::info!("Would switch LED at 0x{target:04x} to {on}");
    }

    for (topic, payload) in publisher.published() {
        let record: BridgeRecord = serde_json::from_slice(&payload)?;
        log::info!("{topic}: {}", serde_json::to_string_pretty(&record)?);
    }
    Ok(())
}
