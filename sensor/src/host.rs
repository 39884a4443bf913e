use std::{
    path::PathBuf,
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::Context;
use homenode_common::{
    battery_volts_from_adc, host_session::MqttSession, Link, Network, NetworkWait, RuntimeConfig,
    SensorNode, SensorSource, ServerEndpoint, StdDelay,
};
use tracing::{debug, info, warn};

const CLIENT_ID: &str = "homenode-sensor";

struct HostNetwork;

impl Network for HostNetwork {
    fn begin(&mut self) {}

    fn is_associated(&mut self) -> bool {
        true
    }
}

/// Synthetic readings that sweep across the alarm thresholds.
#[derive(Default)]
struct SimulatedSensors {
    tick: u64,
}

impl SensorSource for SimulatedSensors {
    fn read_climate(&mut self) -> Option<(f32, f32)> {
        self.tick = self.tick.saturating_add(1);
        let temperature_c = 17.0 + (self.tick % 12) as f32 * 0.5;
        let humidity = 42.0 + (self.tick % 6) as f32 * 0.5;
        debug!(temperature_c, humidity, "simulated climate sample");
        Some((temperature_c, humidity))
    }

    fn read_voc_index(&mut self, _temperature_c: f32, _humidity: f32) -> Option<u16> {
        Some(40 + (self.tick % 25) as u16)
    }

    fn read_lux(&mut self) -> Option<f32> {
        Some(30.0 + (self.tick % 10) as f32 * 10.0)
    }

    fn read_battery_v(&mut self) -> Option<f32> {
        let raw = 2_100_u16.saturating_sub((self.tick % 200) as u16);
        Some(battery_volts_from_adc(raw))
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("HOMENODE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("homenode.json"));
    let mut runtime = RuntimeConfig::load(&config_path).unwrap_or_else(|err| {
        warn!("failed to load config from {}: {err}", config_path.display());
        RuntimeConfig::default()
    });
    runtime.apply_overrides(|key| std::env::var(key).ok());
    runtime.sanitize();
    runtime.validate().context("invalid sensor config")?;

    let session = MqttSession::new(
        tokio::runtime::Handle::current(),
        CLIENT_ID,
        runtime.transport.clone(),
        Duration::from_millis(runtime.link.connect_timeout_ms),
    );
    let link = Link::new(
        HostNetwork,
        session,
        StdDelay,
        ServerEndpoint::from(&runtime.network),
        NetworkWait::from(&runtime.link),
    );
    let mut node = SensorNode::new(
        link,
        SimulatedSensors::default(),
        runtime.sensor.clone(),
        env!("CARGO_PKG_VERSION"),
    );

    info!(
        "sensor publisher started, sampling every {} ms",
        runtime.sensor.sample_interval_ms
    );
    tokio::task::spawn_blocking(move || node.run(monotonic_ms))
        .await
        .context("sensor loop panicked")??;
    Ok(())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
