use embedded_svc::wifi::{AuthMethod, ClientConfiguration, Configuration};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop, hal::modem::Modem, nvs::EspDefaultNvsPartition,
    sys::EspError, wifi::EspWifi,
};
use log::{info, warn};
use thiserror::Error;

use crate::{config::NetworkConfig, link::Network};

#[derive(Debug, Error)]
pub enum WifiError {
    #[error("wifi ssid too long")]
    SsidTooLong,
    #[error("wifi password too long")]
    PasswordTooLong,
    #[error("wifi driver error: {0}")]
    Driver(#[from] EspError),
}

/// Station-mode Wi-Fi. Association is started by [`Network::begin`] and completes
/// in the background.
pub struct EspNetwork {
    wifi: EspWifi<'static>,
}

impl EspNetwork {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> Result<Self, WifiError> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs))?;

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| WifiError::SsidTooLong)?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| WifiError::PasswordTooLong)?,
            auth_method,
            ..Default::default()
        }))?;
        wifi.start()?;
        info!("wifi started for `{}`", network.wifi_ssid);

        Ok(Self { wifi })
    }
}

impl Network for EspNetwork {
    fn begin(&mut self) {
        if let Err(err) = self.wifi.connect() {
            warn!("wifi connect request failed: {err:?}");
        }
    }

    fn is_associated(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }
}
