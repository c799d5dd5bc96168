//! WLED JSON API sender.
//!
//! WLED controllers live on the LAN and answer fast or not at all, hence the
//! short request timeout.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::config::{Configuration, WledDeviceConfiguration};
use crate::errors::Error;
use crate::mapping;
use crate::resolver::{BrightnessSource, ProtocolCommand};

type Result<T> = std::result::Result<T, Error>;

const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Partial WLED state body: only the fields being changed are serialized.
#[skip_serializing_none]
#[derive(Debug, Default, Serialize)]
struct StateBody {
    on: Option<bool>,
    /// Native 0-255 scale.
    bri: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    #[serde(default)]
    bri: i64,
}

fn state_body(command: &ProtocolCommand) -> Option<StateBody> {
    match *command {
        ProtocolCommand::TurnOn => Some(StateBody {
            on: Some(true),
            ..StateBody::default()
        }),
        ProtocolCommand::TurnOff => Some(StateBody {
            on: Some(false),
            ..StateBody::default()
        }),
        ProtocolCommand::SetBrightness(value) => Some(StateBody {
            bri: Some(value),
            ..StateBody::default()
        }),
        ProtocolCommand::SetColor { .. } => None,
    }
}

pub struct WledSender {
    client: reqwest::Client,
    devices: HashMap<String, WledDeviceConfiguration>,
}

impl WledSender {
    pub fn new(configuration: &Configuration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(WledSender {
            client,
            devices: configuration.wled.clone(),
        })
    }

    fn device_ip(&self, device: &str) -> Result<&str> {
        self.devices
            .get(device)
            .map(|d| d.ip.as_str())
            .ok_or_else(|| Error::DeviceNotFound(device.to_string()))
    }

    pub async fn send(&self, device: &str, command: &ProtocolCommand) -> Result<()> {
        let Some(body) = state_body(command) else {
            warn!("WLED does not support command {command:?}; dropping");
            return Ok(());
        };
        let ip = self.device_ip(device)?;

        debug!("Sending state change to WLED device [{device}] at {ip}");
        let response = self
            .client
            .post(format!("http://{ip}/json/state"))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::DeviceStatus {
                device: device.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Current brightness of the device, as a 0-100 percentage.
    pub async fn device_brightness(&self, device: &str) -> Result<i64> {
        let ip = self.device_ip(device)?;

        debug!("Getting brightness from WLED device [{device}] at {ip}");
        let state = self
            .client
            .get(format!("http://{ip}/json/state"))
            .send()
            .await?
            .error_for_status()?
            .json::<StateResponse>()
            .await?;

        Ok(mapping::linear_map(state.bri, [0, 255], [0, 100]))
    }
}

impl BrightnessSource for WledSender {
    async fn device_brightness(&self, device: &str) -> Result<i64> {
        WledSender::device_brightness(self, device).await
    }
}
