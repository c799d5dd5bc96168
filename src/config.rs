//! Configuration file schema and action table lookups.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use strum_macros::{Display, EnumString};

use crate::errors::Error;

type Result<T> = std::result::Result<T, Error>;

/// The condition that activates a configured action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ActionTrigger {
    #[serde(rename = "hue tap dial button press")]
    DialButtonPress,
    #[serde(rename = "hue light sync")]
    LightSync,
    #[serde(rename = "presence sensor")]
    PresenceSensor,
}

/// What a sub-action asks a downstream device to do.
///
/// Unrecognized spellings deserialize into [`DeviceAction::Unknown`] so a
/// typo in one sub-action is skipped at resolution time instead of failing
/// the whole configuration load.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(from = "String")]
pub enum DeviceAction {
    #[strum(serialize = "turn on")]
    TurnOn,
    #[strum(serialize = "turn off")]
    TurnOff,
    #[strum(serialize = "set brightness")]
    SetBrightness,
    #[strum(serialize = "increase brightness")]
    IncreaseBrightness,
    #[strum(serialize = "decrease brightness")]
    DecreaseBrightness,
    #[strum(default)]
    Unknown(String),
}

impl From<String> for DeviceAction {
    fn from(s: String) -> Self {
        // The `#[strum(default)]` variant makes this infallible.
        DeviceAction::from_str(&s).unwrap_or(DeviceAction::Unknown(s))
    }
}

/// Which light-state dimension a sub-action reacts to on a light-sync
/// trigger.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(from = "String")]
pub enum SyncValue {
    #[strum(serialize = "on-off")]
    OnOff,
    #[strum(serialize = "on")]
    On,
    #[strum(serialize = "off")]
    Off,
    #[strum(serialize = "brightness")]
    Brightness,
    #[strum(serialize = "color")]
    Color,
    #[strum(default)]
    Unknown(String),
}

impl From<String> for SyncValue {
    fn from(s: String) -> Self {
        SyncValue::from_str(&s).unwrap_or(SyncValue::Unknown(s))
    }
}

/// What to do with a Govee device connection after a failed datagram write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendFailurePolicy {
    /// Log and keep the connection open (the historical behavior).
    #[default]
    Ignore,
    /// Drop the connection back to discovered so the next scan announcement
    /// redials the device.
    Reconnect,
}

/// One per-protocol instruction within a configured action.
#[derive(Debug, Clone, Deserialize)]
pub struct SubAction {
    #[serde(default)]
    pub device: String,
    #[serde(default = "SubAction::default_action")]
    pub action: DeviceAction,
    pub sync_value: Option<SyncValue>,
    /// A 2-element `[lo, hi]` window the incoming 0-100 brightness is
    /// remapped into. Other lengths are ignored.
    pub brightness_range: Option<Vec<i64>>,
    /// Amount for set/increase/decrease brightness actions.
    pub value: Option<i64>,
}

impl SubAction {
    fn default_action() -> DeviceAction {
        DeviceAction::Unknown(String::new())
    }

    /// The declared `[lo, hi]` brightness window, if it has exactly two
    /// elements.
    pub fn brightness_window(&self) -> Option<[i64; 2]> {
        match self.brightness_range.as_deref() {
            Some(&[lo, hi]) => Some([lo, hi]),
            _ => None,
        }
    }
}

/// One trigger with its ordered per-protocol sub-actions.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigurationAction {
    pub trigger: ActionTrigger,
    #[serde(default)]
    pub dial_name: String,
    #[serde(default)]
    pub light_name: String,
    #[serde(default)]
    pub presence_sensor_name: String,
    #[serde(default)]
    pub hue_tap_dial_buttons: Vec<i64>,
    #[serde(default)]
    pub govee_actions: Vec<SubAction>,
    #[serde(default)]
    pub twinkly_actions: Vec<SubAction>,
    #[serde(default)]
    pub switchbot_actions: Vec<SubAction>,
    #[serde(default)]
    pub wled_actions: Vec<SubAction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoveeDeviceConfiguration {
    /// The device identifier announced in scan responses.
    #[serde(default)]
    pub mac: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwitchbotDeviceConfiguration {
    pub device_id: String,
    pub authorization: SwitchbotAuthorization,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwitchbotAuthorization {
    pub token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WledDeviceConfiguration {
    pub ip: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TwinklyDeviceConfiguration {
    pub ip: String,
}

/// The parsed configuration file: hub coordinates, the action table and the
/// per-protocol device tables. Immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub bridge_ip: String,
    #[serde(default)]
    pub bridge_username: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub actions: Vec<ConfigurationAction>,
    #[serde(default)]
    pub govee: HashMap<String, GoveeDeviceConfiguration>,
    #[serde(default)]
    pub switchbot: HashMap<String, SwitchbotDeviceConfiguration>,
    #[serde(default)]
    pub wled: HashMap<String, WledDeviceConfiguration>,
    #[serde(default)]
    pub twinkly: HashMap<String, TwinklyDeviceConfiguration>,
    #[serde(default)]
    pub govee_send_failure: SendFailurePolicy,

    // Lookup indexes precomputed at load; the action table never changes
    // afterwards.
    #[serde(skip)]
    tracked_lights: HashSet<String>,
    #[serde(skip)]
    tracked_sensors: HashSet<String>,
}

impl Configuration {
    /// Load and parse the configuration file. Any failure here is
    /// startup-fatal for the process.
    pub fn load(path: &Path) -> Result<Configuration> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    /// Parse a configuration from its raw JSON text.
    pub fn parse(raw: &str) -> Result<Configuration> {
        let mut configuration: Configuration =
            serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        configuration.build_indexes();
        Ok(configuration)
    }

    fn build_indexes(&mut self) {
        for action in &self.actions {
            match action.trigger {
                ActionTrigger::LightSync => {
                    self.tracked_lights.insert(action.light_name.clone());
                }
                ActionTrigger::PresenceSensor => {
                    self.tracked_sensors
                        .insert(action.presence_sensor_name.clone());
                }
                ActionTrigger::DialButtonPress => {}
            }
        }
    }

    /// Every Govee device alias some action targets. The connection registry
    /// pre-registers these before discovery.
    pub fn required_govee_devices(&self) -> Vec<String> {
        let mut devices = Vec::new();
        for action in &self.actions {
            for govee_action in &action.govee_actions {
                if !devices.contains(&govee_action.device) {
                    devices.push(govee_action.device.clone());
                }
            }
        }
        devices
    }

    /// Every dial name some action references.
    pub fn required_dials(&self) -> HashSet<String> {
        self.actions
            .iter()
            .filter(|a| !a.dial_name.is_empty())
            .map(|a| a.dial_name.clone())
            .collect()
    }

    /// Whether some light-sync action references this light.
    pub fn tracks_light(&self, light_name: &str) -> bool {
        self.tracked_lights.contains(light_name)
    }

    /// Whether some presence-sensor action references this sensor.
    pub fn tracks_presence_sensor(&self, sensor_name: &str) -> bool {
        self.tracked_sensors.contains(sensor_name)
    }

    /// Resolve the configured alias for an announced Govee device
    /// identifier, falling back to the identifier itself.
    pub fn govee_alias_for(&self, announced: &str) -> String {
        for (alias, device) in &self.govee {
            if device.mac == announced {
                return alias.clone();
            }
        }
        announced.to_string()
    }

    pub fn switchbot_aliases(&self) -> Vec<String> {
        self.switchbot.keys().cloned().collect()
    }

    pub fn wled_aliases(&self) -> Vec<String> {
        self.wled.keys().cloned().collect()
    }

    pub fn twinkly_aliases(&self) -> Vec<String> {
        self.twinkly.keys().cloned().collect()
    }
}
