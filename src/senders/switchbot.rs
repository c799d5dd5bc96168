//! Switchbot cloud API sender.

use std::collections::HashMap;

use log::{debug, warn};
use serde::Serialize;

use crate::config::{Configuration, SwitchbotDeviceConfiguration};
use crate::errors::Error;
use crate::resolver::ProtocolCommand;

type Result<T> = std::result::Result<T, Error>;

const API_BASE: &str = "https://api.switch-bot.com/v1.0";

#[derive(Debug, Serialize)]
struct CommandBody {
    command: &'static str,
    parameter: String,
    #[serde(rename = "commandType")]
    command_type: &'static str,
}

fn command_body(command: &ProtocolCommand) -> Option<CommandBody> {
    let (name, parameter) = match command {
        ProtocolCommand::TurnOn => ("turnOn", "default".to_string()),
        ProtocolCommand::TurnOff => ("turnOff", "default".to_string()),
        ProtocolCommand::SetBrightness(value) => ("setBrightness", value.to_string()),
        ProtocolCommand::SetColor { .. } => return None,
    };
    Some(CommandBody {
        command: name,
        parameter,
        command_type: "command",
    })
}

pub struct SwitchbotSender {
    client: reqwest::Client,
    devices: HashMap<String, SwitchbotDeviceConfiguration>,
}

impl SwitchbotSender {
    pub fn new(configuration: &Configuration) -> Self {
        SwitchbotSender {
            client: reqwest::Client::new(),
            devices: configuration.switchbot.clone(),
        }
    }

    pub async fn send(&self, device: &str, command: &ProtocolCommand) -> Result<()> {
        let Some(body) = command_body(command) else {
            warn!("Switchbot does not support command {command:?}; dropping");
            return Ok(());
        };
        let configured = self
            .devices
            .get(device)
            .ok_or_else(|| Error::DeviceNotFound(device.to_string()))?;

        debug!(
            "Sending [{}] to Switchbot device [{device}]",
            body.command
        );
        let response = self
            .client
            .post(format!(
                "{API_BASE}/devices/{}/commands",
                configured.device_id
            ))
            .header("Authorization", &configured.authorization.token)
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_body_shapes() {
        let body = command_body(&ProtocolCommand::SetBrightness(42)).unwrap();
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "command": "setBrightness",
                "parameter": "42",
                "commandType": "command"
            })
        );

        let body = command_body(&ProtocolCommand::TurnOn).unwrap();
        assert_eq!(body.command, "turnOn");
        assert_eq!(body.parameter, "default");
    }

    #[test]
    fn test_color_is_unsupported() {
        assert!(command_body(&ProtocolCommand::SetColor { r: 1, g: 2, b: 3 }).is_none());
    }

    #[tokio::test]
    async fn test_unknown_device_fails() {
        let configuration = Configuration::parse("{}").unwrap();
        let sender = SwitchbotSender::new(&configuration);
        let err = sender
            .send("Plug", &ProtocolCommand::TurnOn)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }
}
