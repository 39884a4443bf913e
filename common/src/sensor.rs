use log::{info, warn};
use serde_json::{json, Value};

use crate::{
    alarm::{AlarmMonitor, LatestReadings},
    config::SensorConfig,
    link::{Delay, Link, LinkError, Network, Session},
    topics::{KEY_BATTERY, KEY_HUMIDITY, KEY_LUX, KEY_TEMPERATURE, KEY_VERSION, KEY_VOC},
};

const DEFAULT_COMPENSATION_C: f32 = 25.0;
const DEFAULT_COMPENSATION_RH: f32 = 50.0;

/// Read contract of the environmental sensor drivers. `None` means the read failed.
pub trait SensorSource {
    /// Temperature in °C and relative humidity in %.
    fn read_climate(&mut self) -> Option<(f32, f32)>;
    /// VOC index compensated for the given climate. Returns `None` when the raw
    /// signal is not valid yet.
    fn read_voc_index(&mut self, temperature_c: f32, humidity: f32) -> Option<u16>;
    fn read_lux(&mut self) -> Option<f32>;
    fn read_battery_v(&mut self) -> Option<f32>;
}

/// Battery voltage behind a 1/2 divider on a 12-bit ADC with a 3.3 V reference.
pub fn battery_volts_from_adc(raw: u16) -> f32 {
    f32::from(raw) * 2.0 * 3.3 / 4095.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorTick {
    SessionUnavailable,
    Sampled,
}

pub struct SensorNode<N, S, R, D> {
    link: Link<N, S, D>,
    sensors: R,
    config: SensorConfig,
    alarms: AlarmMonitor,
    latest: LatestReadings,
    last_voc_ms: u64,
    version: String,
    version_published: bool,
}

impl<N: Network, S: Session, R: SensorSource, D: Delay> SensorNode<N, S, R, D> {
    pub fn new(link: Link<N, S, D>, sensors: R, config: SensorConfig, version: impl Into<String>) -> Self {
        Self {
            link,
            sensors,
            alarms: AlarmMonitor::new(config.thresholds.clone()),
            config,
            latest: LatestReadings::default(),
            last_voc_ms: 0,
            version: version.into(),
            version_published: false,
        }
    }

    pub fn link(&self) -> &Link<N, S, D> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link<N, S, D> {
        &mut self.link
    }

    pub fn sensors(&self) -> &R {
        &self.sensors
    }

    pub fn latest(&self) -> &LatestReadings {
        &self.latest
    }

    pub fn alarms(&self) -> &AlarmMonitor {
        &self.alarms
    }

    pub fn tick(&mut self, now_ms: u64) -> Result<SensorTick, LinkError> {
        self.link.ensure_network()?;

        if !self.link.ensure_session() {
            return Ok(SensorTick::SessionUnavailable);
        }

        if !self.version_published {
            info!("sending boot attributes");
            if let Err(err) = self
                .link
                .session_mut()
                .send_attribute(KEY_VERSION, Value::String(self.version.clone()))
            {
                warn!("boot attribute {KEY_VERSION} not published: {err}");
            }
            self.version_published = true;
        }

        if let Some((temperature_c, humidity)) = self.sensors.read_climate() {
            self.latest.temperature_c = Some(temperature_c);
            self.latest.humidity = Some(humidity);
            self.publish(KEY_TEMPERATURE, rounded(temperature_c));
            self.publish(KEY_HUMIDITY, rounded(humidity));
        }

        if now_ms.saturating_sub(self.last_voc_ms) >= self.config.voc_stabilization_ms {
            let temperature_c = self.latest.temperature_c.unwrap_or(DEFAULT_COMPENSATION_C);
            let humidity = self.latest.humidity.unwrap_or(DEFAULT_COMPENSATION_RH);
            match self.sensors.read_voc_index(temperature_c, humidity) {
                Some(index) => {
                    info!("voc index {index}");
                    self.latest.voc_index = Some(index);
                    self.last_voc_ms = now_ms;
                    self.publish(KEY_VOC, json!(index));
                }
                None => warn!("voc raw signal invalid, retrying next sample"),
            }
        }

        if let Some(lux) = self.sensors.read_lux() {
            self.latest.lux = Some(lux);
            self.publish(KEY_LUX, rounded(lux));
        }

        if let Some(battery_v) = self.sensors.read_battery_v() {
            self.latest.battery_v = Some(battery_v);
            self.publish(KEY_BATTERY, rounded(battery_v));
        }

        for transition in self.alarms.evaluate(&self.latest) {
            info!(
                "alarm {} {}",
                transition.alarm.key(),
                if transition.active { "raised" } else { "cleared" }
            );
            self.publish(transition.alarm.key(), Value::Bool(transition.active));
        }

        self.link.session_mut().service();
        Ok(SensorTick::Sampled)
    }

    /// Samples forever, waiting the configured interval after every full sample.
    pub fn run(&mut self, mut now_ms: impl FnMut() -> u64) -> Result<(), LinkError> {
        loop {
            if self.tick(now_ms())? == SensorTick::Sampled {
                self.link.delay_ms(self.config.sample_interval_ms);
            }
        }
    }

    fn publish(&mut self, key: &str, value: Value) {
        if let Err(err) = self.link.session_mut().send_telemetry(key, value) {
            warn!("failed to publish {key}: {err}");
        }
    }
}

fn rounded(value: f32) -> Value {
    json!((f64::from(value) * 100.0).round() / 100.0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        alarm::Alarm,
        mock::{link_with, MockDelay, MockNetwork, MockSession, ScriptedSensors},
    };

    type TestNode = SensorNode<MockNetwork, MockSession, ScriptedSensors, MockDelay>;

    fn node_with(sensors: ScriptedSensors) -> TestNode {
        SensorNode::new(
            link_with(MockNetwork::associated_after(0), MockSession::online()),
            sensors,
            SensorConfig::default(),
            "1.2.0",
        )
    }

    fn climate(samples: &[f32]) -> ScriptedSensors {
        ScriptedSensors {
            climate: samples.iter().map(|t| Some((*t, 45.0))).collect(),
            ..ScriptedSensors::default()
        }
    }

    #[test]
    fn temperature_alarm_published_once_per_crossing() {
        let mut node = node_with(climate(&[18.0, 21.0, 23.0, 24.0, 19.5, 19.0]));

        for step in 0..6 {
            node.tick(step * 2_000).unwrap();
        }

        assert_eq!(
            node.link().session().telemetry_for("temp_alarm_high"),
            vec![json!(true), json!(false)]
        );
        assert!(node
            .link()
            .session()
            .telemetry_for("temp_alarm_low")
            .is_empty());
    }

    #[test]
    fn alarm_flag_flips_even_when_publish_fails() {
        let mut node = node_with(climate(&[23.0, 24.0]));
        node.link_mut().session_mut().fail_sends(true);

        node.tick(0).unwrap();
        assert!(node.alarms().is_active(Alarm::TempHigh));

        node.link_mut().session_mut().fail_sends(false);
        node.tick(2_000).unwrap();

        let attempts: Vec<_> = node
            .link()
            .session()
            .telemetry()
            .iter()
            .filter(|sent| sent.key == "temp_alarm_high")
            .cloned()
            .collect();
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].delivered);
        assert!(node.alarms().is_active(Alarm::TempHigh));
    }

    #[test]
    fn readings_published_as_telemetry() {
        let mut sensors = climate(&[21.3]);
        sensors.lux = Some(120.5);
        sensors.battery_v = Some(3.9);
        let mut node = node_with(sensors);

        node.tick(0).unwrap();

        let session = node.link().session();
        assert_eq!(session.telemetry_for("temperature"), vec![json!(21.3)]);
        assert_eq!(session.telemetry_for("humidity"), vec![json!(45.0)]);
        assert_eq!(session.telemetry_for("lux"), vec![json!(120.5)]);
        assert_eq!(session.telemetry_for("battery"), vec![json!(3.9)]);
        assert_eq!(session.services(), 1);
    }

    #[test]
    fn voc_read_once_per_stabilization_window() {
        let mut sensors = climate(&[21.0]);
        sensors.voc.push_back(Some(42));
        let mut node = node_with(sensors);

        node.tick(2_000).unwrap();
        assert_eq!(node.sensors().voc_reads, 0);

        node.tick(80_000).unwrap();
        node.tick(82_000).unwrap();
        node.tick(159_000).unwrap();
        assert_eq!(node.sensors().voc_reads, 1);

        node.tick(160_000).unwrap();
        assert_eq!(node.sensors().voc_reads, 2);
        assert_eq!(
            node.link().session().telemetry_for("voc"),
            vec![json!(42), json!(42)]
        );
    }

    #[test]
    fn invalid_voc_signal_retries_next_sample() {
        let mut sensors = climate(&[21.0]);
        sensors.voc = [None, Some(60)].into_iter().collect();
        let mut node = node_with(sensors);

        node.tick(80_000).unwrap();
        node.tick(82_000).unwrap();

        assert_eq!(node.sensors().voc_reads, 2);
        assert_eq!(node.latest().voc_index, Some(60));
        assert_eq!(
            node.link().session().telemetry_for("voc_alarm"),
            vec![json!(true)]
        );
    }

    #[test]
    fn version_published_once() {
        let mut node = node_with(climate(&[21.0]));

        for step in 0..3 {
            node.link_mut().session_mut().drop_connection();
            node.tick(step * 2_000).unwrap();
        }

        let versions = node
            .link()
            .session()
            .attributes()
            .iter()
            .filter(|sent| sent.key == "VERSION")
            .count();
        assert_eq!(versions, 1);
    }

    #[test]
    fn offline_session_skips_sampling() {
        let mut node = SensorNode::new(
            link_with(MockNetwork::associated_after(0), MockSession::offline()),
            climate(&[21.0]),
            SensorConfig::default(),
            "1.2.0",
        );

        assert_eq!(node.tick(0).unwrap(), SensorTick::SessionUnavailable);
        assert!(node.link().session().telemetry().is_empty());
        assert_eq!(node.latest(), &LatestReadings::default());
    }

    #[test]
    fn battery_conversion_matches_divider() {
        assert_eq!(battery_volts_from_adc(0), 0.0);
        assert!((battery_volts_from_adc(4095) - 6.6).abs() < 1e-4);
        assert!((battery_volts_from_adc(2048) - 3.3008).abs() < 1e-3);
    }
}
