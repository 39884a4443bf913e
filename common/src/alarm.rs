use crate::config::AlarmThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    TempHigh,
    TempLow,
    Voc,
    Battery,
}

impl Alarm {
    pub fn key(self) -> &'static str {
        match self {
            Self::TempHigh => "temp_alarm_high",
            Self::TempLow => "temp_alarm_low",
            Self::Voc => "voc_alarm",
            Self::Battery => "battery_alarm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmTransition {
    pub alarm: Alarm,
    pub active: bool,
}

/// Latest known value of each monitored quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatestReadings {
    pub temperature_c: Option<f32>,
    pub humidity: Option<f32>,
    pub voc_index: Option<u16>,
    pub lux: Option<f32>,
    pub battery_v: Option<f32>,
}

/// Edge-triggered threshold alarms: a transition is reported once per crossing.
#[derive(Debug, Clone)]
pub struct AlarmMonitor {
    thresholds: AlarmThresholds,
    temp_high: bool,
    temp_low: bool,
    voc: bool,
    battery: bool,
}

impl AlarmMonitor {
    pub fn new(thresholds: AlarmThresholds) -> Self {
        Self {
            thresholds,
            temp_high: false,
            temp_low: false,
            voc: false,
            battery: false,
        }
    }

    pub fn is_active(&self, alarm: Alarm) -> bool {
        match alarm {
            Alarm::TempHigh => self.temp_high,
            Alarm::TempLow => self.temp_low,
            Alarm::Voc => self.voc,
            Alarm::Battery => self.battery,
        }
    }

    pub fn evaluate(&mut self, readings: &LatestReadings) -> Vec<AlarmTransition> {
        let t = &self.thresholds;
        let mut transitions = Vec::new();

        if let Some(temp) = readings.temperature_c {
            push_edge(
                &mut transitions,
                Alarm::TempHigh,
                &mut self.temp_high,
                temp > t.temp_high_c,
                temp <= t.temp_high_c,
            );
            push_edge(
                &mut transitions,
                Alarm::TempLow,
                &mut self.temp_low,
                temp < t.temp_low_c,
                temp >= t.temp_low_c,
            );
        }

        // A reading exactly at the VOC threshold holds the current state.
        if let Some(voc) = readings.voc_index {
            push_edge(
                &mut transitions,
                Alarm::Voc,
                &mut self.voc,
                voc > t.voc_high,
                voc < t.voc_high,
            );
        }

        if let Some(battery) = readings.battery_v {
            let low = battery < t.battery_low_v;
            push_edge(&mut transitions, Alarm::Battery, &mut self.battery, low, !low);
        }

        transitions
    }
}

fn push_edge(
    transitions: &mut Vec<AlarmTransition>,
    alarm: Alarm,
    active: &mut bool,
    raise: bool,
    clear: bool,
) {
    if raise && !*active {
        *active = true;
        transitions.push(AlarmTransition {
            alarm,
            active: true,
        });
    } else if clear && *active {
        *active = false;
        transitions.push(AlarmTransition {
            alarm,
            active: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn temp(value: f32) -> LatestReadings {
        LatestReadings {
            temperature_c: Some(value),
            ..LatestReadings::default()
        }
    }

    fn quiet() -> Vec<AlarmTransition> {
        Vec::new()
    }

    fn raised(alarm: Alarm) -> AlarmTransition {
        AlarmTransition {
            alarm,
            active: true,
        }
    }

    fn cleared(alarm: Alarm) -> AlarmTransition {
        AlarmTransition {
            alarm,
            active: false,
        }
    }

    #[test]
    fn high_temperature_is_edge_triggered() {
        let mut monitor = AlarmMonitor::new(AlarmThresholds::default());

        assert_eq!(monitor.evaluate(&temp(19.0)), quiet());
        assert_eq!(monitor.evaluate(&temp(21.0)), vec![raised(Alarm::TempHigh)]);
        assert_eq!(monitor.evaluate(&temp(22.5)), quiet());
        assert_eq!(monitor.evaluate(&temp(25.0)), quiet());
        assert_eq!(monitor.evaluate(&temp(20.0)), vec![cleared(Alarm::TempHigh)]);
        assert_eq!(monitor.evaluate(&temp(18.0)), quiet());
    }

    #[test]
    fn low_temperature_clears_at_threshold() {
        let mut monitor = AlarmMonitor::new(AlarmThresholds::default());

        assert_eq!(monitor.evaluate(&temp(-0.5)), vec![raised(Alarm::TempLow)]);
        assert_eq!(monitor.evaluate(&temp(-3.0)), quiet());
        assert_eq!(monitor.evaluate(&temp(0.0)), vec![cleared(Alarm::TempLow)]);
    }

    #[test]
    fn voc_at_threshold_holds_state() {
        let mut monitor = AlarmMonitor::new(AlarmThresholds::default());
        let voc = |index| LatestReadings {
            voc_index: Some(index),
            ..LatestReadings::default()
        };

        assert_eq!(monitor.evaluate(&voc(50)), quiet());
        assert_eq!(monitor.evaluate(&voc(51)), vec![raised(Alarm::Voc)]);
        assert_eq!(monitor.evaluate(&voc(50)), quiet());
        assert!(monitor.is_active(Alarm::Voc));
        assert_eq!(monitor.evaluate(&voc(49)), vec![cleared(Alarm::Voc)]);
    }

    #[test]
    fn battery_alarm_tracks_low_voltage() {
        let mut monitor = AlarmMonitor::new(AlarmThresholds::default());
        let battery = |volts| LatestReadings {
            battery_v: Some(volts),
            ..LatestReadings::default()
        };

        assert_eq!(monitor.evaluate(&battery(3.2)), vec![raised(Alarm::Battery)]);
        assert_eq!(monitor.evaluate(&battery(3.1)), quiet());
        assert_eq!(monitor.evaluate(&battery(3.3)), vec![cleared(Alarm::Battery)]);
    }

    #[test]
    fn missing_readings_leave_alarms_alone() {
        let mut monitor = AlarmMonitor::new(AlarmThresholds::default());
        monitor.evaluate(&temp(30.0));

        assert_eq!(monitor.evaluate(&LatestReadings::default()), quiet());
        assert!(monitor.is_active(Alarm::TempHigh));
    }
}
