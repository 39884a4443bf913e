pub mod actuator;
pub mod alarm;
pub mod config;
pub mod drivers;
pub mod link;
pub mod relay;
pub mod rpc;
pub mod sensor;
pub mod topics;

#[cfg(any(feature = "esp32", test))]
pub mod inbox;
#[cfg(feature = "esp32")]
pub mod esp_session;
#[cfg(feature = "esp32")]
pub mod esp_wifi;
#[cfg(not(any(target_arch = "xtensa", target_arch = "riscv32")))]
pub mod host_session;

#[cfg(test)]
mod mock;

pub use actuator::{Actuator, ActuatorStates};
pub use alarm::{Alarm, AlarmMonitor, AlarmTransition, LatestReadings};
pub use config::{ConfigError, RuntimeConfig};
pub use link::{
    Delay, Link, LinkError, Network, NetworkWait, ServerEndpoint, Session, SessionError, StdDelay,
};
pub use relay::{PinError, RelayNode, RelayPins, TickOutcome};
pub use rpc::{DispatchTable, RpcError, RpcRequest, RpcResponse};
pub use sensor::{battery_volts_from_adc, SensorNode, SensorSource, SensorTick};
pub use topics::*;
