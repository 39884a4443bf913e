use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Actuator {
    Light,
    Vmc,
    Heater,
    Ac,
}

impl Actuator {
    pub const ALL: [Actuator; 4] = [Self::Light, Self::Vmc, Self::Heater, Self::Ac];

    /// Attribute key used both for telemetry and for status-inquiry responses.
    pub fn key(self) -> &'static str {
        match self {
            Self::Light => "LIGHT_RELAY",
            Self::Vmc => "VMC_RELAY",
            Self::Heater => "HEATER_RELAY",
            Self::Ac => "AC_RELAY",
        }
    }

    pub fn set_method(self) -> &'static str {
        match self {
            Self::Light => "set_light_switch",
            Self::Vmc => "set_vmc_switch",
            Self::Heater => "set_heater_switch",
            Self::Ac => "set_ac_switch",
        }
    }

    pub fn get_method(self) -> &'static str {
        match self {
            Self::Light => "get_light_switch",
            Self::Vmc => "get_vmc_switch",
            Self::Heater => "get_heater_switch",
            Self::Ac => "get_ac_switch",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Light => 0,
            Self::Vmc => 1,
            Self::Heater => 2,
            Self::Ac => 3,
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Light => "light",
            Self::Vmc => "vmc",
            Self::Heater => "heater",
            Self::Ac => "ac",
        };
        f.write_str(name)
    }
}

/// Last applied logical state of every relay. All relays start de-energized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActuatorStates {
    energized: [bool; 4],
}

impl ActuatorStates {
    pub fn get(&self, actuator: Actuator) -> bool {
        self.energized[actuator.index()]
    }

    pub(crate) fn record(&mut self, actuator: Actuator, energized: bool) {
        self.energized[actuator.index()] = energized;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Actuator, bool)> + '_ {
        Actuator::ALL.into_iter().map(|actuator| (actuator, self.get(actuator)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relays_boot_de_energized() {
        let states = ActuatorStates::default();
        assert!(states.iter().all(|(_, energized)| !energized));
    }

    #[test]
    fn record_touches_only_one_relay() {
        let mut states = ActuatorStates::default();
        states.record(Actuator::Heater, true);

        assert!(states.get(Actuator::Heater));
        assert!(!states.get(Actuator::Light));
        assert!(!states.get(Actuator::Vmc));
        assert!(!states.get(Actuator::Ac));
    }

    #[test]
    fn method_names_follow_actuator_name() {
        for actuator in Actuator::ALL {
            assert_eq!(actuator.set_method(), format!("set_{actuator}_switch"));
            assert_eq!(actuator.get_method(), format!("get_{actuator}_switch"));
        }
    }
}
