use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use homenode_common::{
    host_session::MqttSession, Actuator, Link, Network, NetworkWait, PinError, RelayNode,
    RelayPins, RuntimeConfig, ServerEndpoint, StdDelay,
};
use tracing::{info, warn};

const CLIENT_ID: &str = "homenode-controller";

/// The host network stack is managed by the OS and always treated as associated.
struct HostNetwork;

impl Network for HostNetwork {
    fn begin(&mut self) {}

    fn is_associated(&mut self) -> bool {
        true
    }
}

/// Relay outputs simulated as logged levels.
#[derive(Debug, Default, PartialEq)]
struct LoggedPins {
    light: bool,
    vmc: bool,
    heater: bool,
    ac: bool,
}

impl RelayPins for LoggedPins {
    fn write(&mut self, actuator: Actuator, energized: bool) -> Result<(), PinError> {
        let level = match actuator {
            Actuator::Light => &mut self.light,
            Actuator::Vmc => &mut self.vmc,
            Actuator::Heater => &mut self.heater,
            Actuator::Ac => &mut self.ac,
        };
        if *level != energized {
            info!(relay = %actuator, energized, "relay output changed");
        }
        *level = energized;
        Ok(())
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
    runtime.validate().context("invalid controller config")?;

    info!(
        "controller config loaded: server=`{}:{}`, encrypted={}",
        runtime.network.server_host, runtime.network.server_port, runtime.network.encrypted
    );

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
    let mut node = RelayNode::new(
        link,
        LoggedPins::default(),
        env!("CARGO_PKG_VERSION"),
        runtime.transport.max_rpc_subscriptions,
    )?
    .with_idle_ms(runtime.link.loop_idle_ms);

    tokio::task::spawn_blocking(move || node.run())
        .await
        .context("relay loop panicked")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_actuator_drives_its_own_output() {
        let mut pins = LoggedPins::default();

        pins.write(Actuator::Vmc, true).unwrap();
        pins.write(Actuator::Ac, true).unwrap();
        pins.write(Actuator::Ac, false).unwrap();

        assert_eq!(
            pins,
            LoggedPins {
                vmc: true,
                ..LoggedPins::default()
            }
        );
    }
}
