use std::time::Duration;

use anyhow::Context;
use esp_idf_hal::gpio::{AnyOutputPin, Output, OutputPin, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop, hal::prelude::Peripherals, log::EspLogger,
    nvs::EspDefaultNvsPartition,
};
use log::{info, warn};

use homenode_common::{
    esp_session::EspMqttSession, esp_wifi::EspNetwork, Actuator, Link, NetworkWait, PinError,
    RelayNode, RelayPins, RuntimeConfig, ServerEndpoint, StdDelay,
};

const CLIENT_ID: &str = "homenode-controller";

struct EspRelayPins {
    light: PinDriver<'static, AnyOutputPin, Output>,
    vmc: PinDriver<'static, AnyOutputPin, Output>,
    heater: PinDriver<'static, AnyOutputPin, Output>,
    ac: PinDriver<'static, AnyOutputPin, Output>,
}

impl RelayPins for EspRelayPins {
    fn write(&mut self, actuator: Actuator, energized: bool) -> Result<(), PinError> {
        let pin = match actuator {
            Actuator::Light => &mut self.light,
            Actuator::Vmc => &mut self.vmc,
            Actuator::Heater => &mut self.heater,
            Actuator::Ac => &mut self.ac,
        };
        pin.set_level(energized.into())
            .map_err(|err| PinError(format!("{actuator}: {err:?}")))
    }
}

fn output(pin: impl OutputPin) -> anyhow::Result<PinDriver<'static, AnyOutputPin, Output>> {
    Ok(PinDriver::output(pin.downgrade_output())?)
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut runtime = RuntimeConfig::from_build_env();
    runtime.sanitize();
    runtime.validate().context("invalid controller config")?;
    if runtime.network.wifi_ssid.is_empty() {
        warn!("no wifi ssid baked into this build");
    }

    info!(
        "controller config: ssid=`{}`, server=`{}:{}`",
        runtime.network.wifi_ssid, runtime.network.server_host, runtime.network.server_port
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let relay_pins = EspRelayPins {
        light: output(pins.gpio26)?,
        vmc: output(pins.gpio25)?,
        heater: output(pins.gpio27)?,
        ac: output(pins.gpio14)?,
    };

    let network = EspNetwork::new(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    let session = EspMqttSession::new(
        CLIENT_ID,
        runtime.transport.clone(),
        Duration::from_millis(runtime.link.connect_timeout_ms),
    );
    let link = Link::new(
        network,
        session,
        StdDelay,
        ServerEndpoint::from(&runtime.network),
        NetworkWait::from(&runtime.link),
    );

    let mut node = RelayNode::new(
        link,
        relay_pins,
        env!("CARGO_PKG_VERSION"),
        runtime.transport.max_rpc_subscriptions,
    )?
    .with_idle_ms(runtime.link.loop_idle_ms);

    node.run()?;
    Ok(())
}
