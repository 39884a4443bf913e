use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::Context;
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::{FreeRtos, BLOCK},
    gpio::Gpio35,
    i2c::{I2cConfig, I2cDriver},
    peripherals::Peripherals,
    prelude::*,
};
use esp_idf_svc::{eventloop::EspSystemEventLoop, log::EspLogger, nvs::EspDefaultNvsPartition};
use log::{info, warn};

use homenode_common::{
    battery_volts_from_adc,
    drivers::{
        aht20_decode, bh1750_lux, sgp40_decode, sgp40_measure_command, VocIndexEstimator,
        AHT20_ADDR, AHT20_INIT, AHT20_MEASURE_MS, AHT20_TRIGGER, BH1750_ADDR,
        BH1750_CONTINUOUS_HIGH_RES, BH1750_POWER_ON, SGP40_ADDR, SGP40_MEASURE_MS,
    },
    esp_session::EspMqttSession,
    esp_wifi::EspNetwork,
    Link, NetworkWait, RuntimeConfig, SensorNode, SensorSource, ServerEndpoint, StdDelay,
};

const CLIENT_ID: &str = "homenode-sensor";
const SGP40_INIT_ATTEMPTS: u32 = 3;
const SGP40_RETRY_MS: u32 = 1_000;

type BatteryChannel = AdcChannelDriver<'static, Gpio35, AdcDriver<'static, ADC1>>;

/// AHT20 + SGP40 + BH1750 on one I²C bus, battery sense on ADC1.
struct BoardSensors {
    i2c: I2cDriver<'static>,
    battery: BatteryChannel,
    voc_index: VocIndexEstimator,
}

impl BoardSensors {
    fn new(i2c: I2cDriver<'static>, battery: BatteryChannel) -> Self {
        let mut sensors = Self {
            i2c,
            battery,
            voc_index: VocIndexEstimator::default(),
        };

        match sensors.i2c.write(AHT20_ADDR, &AHT20_INIT, BLOCK) {
            Ok(()) => info!("AHT20 ready"),
            Err(err) => warn!("AHT20 not found: {err:?}"),
        }

        FreeRtos::delay_ms(SGP40_RETRY_MS);
        let mut sgp_ok = false;
        for attempt in 1..=SGP40_INIT_ATTEMPTS {
            if let Some(raw) = sensors.measure_voc_raw(25.0, 50.0) {
                info!("SGP40 ready, initial raw signal {raw}");
                sgp_ok = true;
                break;
            }
            warn!("SGP40 init attempt {attempt}/{SGP40_INIT_ATTEMPTS} failed");
            FreeRtos::delay_ms(SGP40_RETRY_MS);
        }
        if !sgp_ok {
            warn!("SGP40 unavailable after {SGP40_INIT_ATTEMPTS} attempts");
        }

        let bh1750 = sensors
            .i2c
            .write(BH1750_ADDR, &[BH1750_POWER_ON], BLOCK)
            .and_then(|()| {
                sensors
                    .i2c
                    .write(BH1750_ADDR, &[BH1750_CONTINUOUS_HIGH_RES], BLOCK)
            });
        match bh1750 {
            Ok(()) => info!("BH1750 ready"),
            Err(err) => warn!("BH1750 not found: {err:?}"),
        }

        sensors
    }

    fn measure_voc_raw(&mut self, temperature_c: f32, humidity: f32) -> Option<u16> {
        let command = sgp40_measure_command(temperature_c, humidity);
        if let Err(err) = self.i2c.write(SGP40_ADDR, &command, BLOCK) {
            warn!("SGP40 measure command failed: {err:?}");
            return None;
        }
        FreeRtos::delay_ms(SGP40_MEASURE_MS);

        let mut reply = [0_u8; 3];
        if let Err(err) = self.i2c.read(SGP40_ADDR, &mut reply, BLOCK) {
            warn!("SGP40 read failed: {err:?}");
            return None;
        }
        let raw = sgp40_decode(&reply);
        if raw.is_none() {
            warn!("SGP40 reply failed its checksum");
        }
        raw
    }
}

impl SensorSource for BoardSensors {
    fn read_climate(&mut self) -> Option<(f32, f32)> {
        if let Err(err) = self.i2c.write(AHT20_ADDR, &AHT20_TRIGGER, BLOCK) {
            warn!("AHT20 trigger failed: {err:?}");
            return None;
        }
        FreeRtos::delay_ms(AHT20_MEASURE_MS);

        let mut frame = [0_u8; 6];
        if let Err(err) = self.i2c.read(AHT20_ADDR, &mut frame, BLOCK) {
            warn!("AHT20 read failed: {err:?}");
            return None;
        }
        let climate = aht20_decode(&frame);
        if let Some((temperature_c, humidity)) = climate {
            info!("[AHT20] {temperature_c:.2}°C, {humidity:.2}%");
        }
        climate
    }

    fn read_voc_index(&mut self, temperature_c: f32, humidity: f32) -> Option<u16> {
        let raw = self.measure_voc_raw(temperature_c, humidity)?;
        info!("[SGP40] raw signal {raw}");
        if raw == 0 {
            return None;
        }
        Some(self.voc_index.process(raw))
    }

    fn read_lux(&mut self) -> Option<f32> {
        let mut raw = [0_u8; 2];
        match self.i2c.read(BH1750_ADDR, &mut raw, BLOCK) {
            Ok(()) => Some(bh1750_lux(raw)),
            Err(err) => {
                warn!("BH1750 read failed: {err:?}");
                None
            }
        }
    }

    fn read_battery_v(&mut self) -> Option<f32> {
        match self.battery.read_raw() {
            Ok(raw) => Some(battery_volts_from_adc(raw)),
            Err(err) => {
                warn!("battery ADC read failed: {err:?}");
                None
            }
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut runtime = RuntimeConfig::from_build_env();
    runtime.sanitize();
    runtime.validate().context("invalid sensor config")?;

    info!(
        "sensor config: ssid=`{}`, server=`{}:{}`",
        runtime.network.wifi_ssid, runtime.network.server_host, runtime.network.server_port
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;

    let i2c = I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio21,
        peripherals.pins.gpio22,
        &I2cConfig::new().baudrate(100.kHz().into()),
    )
    .context("failed to initialize i2c bus")?;
    let battery = AdcChannelDriver::new(
        AdcDriver::new(peripherals.adc1)?,
        peripherals.pins.gpio35,
        &AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        },
    )?;
    let sensors = BoardSensors::new(i2c, battery);

    let network = EspNetwork::new(peripherals.modem, sys_loop, nvs_partition, &runtime.network)
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

    let mut node = SensorNode::new(link, sensors, runtime.sensor.clone(), env!("CARGO_PKG_VERSION"));
    node.run(monotonic_ms)?;
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
