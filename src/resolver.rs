//! Trigger-to-command resolution against the configured action table.
//!
//! Each trigger event is matched against the action table and expanded into
//! per-protocol command batches. Resolution also records the intended device
//! state in the status store, so the report endpoint reflects what was
//! commanded even for write-only protocols.

use std::sync::Arc;

use log::warn;

use crate::brightness::BrightnessCache;
use crate::config::{ActionTrigger, Configuration, DeviceAction, SubAction, SyncValue};
use crate::errors::Error;
use crate::mapping;
use crate::status::StatusStore;

const DEFAULT_SET_BRIGHTNESS: i64 = 50;
const DEFAULT_BRIGHTNESS_STEP: i64 = 10;

/// A single resolved instruction for one downstream device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolCommand {
    TurnOn,
    TurnOff,
    /// Brightness in the target protocol's native scale: percent for Govee
    /// and Switchbot, 0-255 for WLED.
    SetBrightness(i64),
    SetColor { r: u8, g: u8, b: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    pub device: String,
    pub command: ProtocolCommand,
}

impl OutboundCommand {
    fn new(device: &str, command: ProtocolCommand) -> Self {
        OutboundCommand {
            device: device.to_string(),
            command,
        }
    }
}

/// Everything one trigger resolved to, grouped by protocol.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OutboundBatch {
    pub govee: Vec<OutboundCommand>,
    pub twinkly: Vec<OutboundCommand>,
    pub switchbot: Vec<OutboundCommand>,
    pub wled: Vec<OutboundCommand>,
}

impl OutboundBatch {
    pub fn is_empty(&self) -> bool {
        self.govee.is_empty()
            && self.twinkly.is_empty()
            && self.switchbot.is_empty()
            && self.wled.is_empty()
    }
}

/// On-miss source for a WLED device's current brightness, in percent.
pub trait BrightnessSource {
    fn device_brightness(
        &self,
        device: &str,
    ) -> impl Future<Output = Result<i64, Error>> + Send;
}

pub struct ActionResolver {
    configuration: Arc<Configuration>,
    status: Arc<StatusStore>,
    brightness: Arc<BrightnessCache>,
}

impl ActionResolver {
    pub fn new(
        configuration: Arc<Configuration>,
        status: Arc<StatusStore>,
        brightness: Arc<BrightnessCache>,
    ) -> Self {
        ActionResolver {
            configuration,
            status,
            brightness,
        }
    }

    /// Resolve a dial button press. Needs the brightness source because
    /// WLED increase/decrease starts from the device's current level.
    pub async fn on_button_pressed<S: BrightnessSource + Sync>(
        &self,
        dial: &str,
        code: i64,
        wled_brightness: &S,
    ) -> OutboundBatch {
        let mut batch = OutboundBatch::default();

        for action in &self.configuration.actions {
            if action.trigger != ActionTrigger::DialButtonPress
                || action.dial_name != dial
                || !action.hue_tap_dial_buttons.contains(&code)
            {
                continue;
            }

            for sub in &action.govee_actions {
                if let Some(command) = self.resolve_power(sub, "Govee") {
                    batch.govee.push(OutboundCommand::new(&sub.device, command));
                }
            }
            for sub in &action.twinkly_actions {
                if let Some(command) = self.resolve_power(sub, "Twinkly") {
                    batch.twinkly.push(OutboundCommand::new(&sub.device, command));
                }
            }
            for sub in &action.switchbot_actions {
                if let Some(command) = self.resolve_power(sub, "Switchbot") {
                    batch.switchbot.push(OutboundCommand::new(&sub.device, command));
                }
            }
            for sub in &action.wled_actions {
                if let Some(command) = self.resolve_wled_dial(sub, wled_brightness).await {
                    batch.wled.push(OutboundCommand::new(&sub.device, command));
                }
            }
        }

        batch
    }

    /// Turn-on/turn-off for protocols without dial-path brightness support.
    fn resolve_power(&self, sub: &SubAction, protocol: &str) -> Option<ProtocolCommand> {
        match sub.action {
            DeviceAction::TurnOn => {
                self.status.set_on(&sub.device, true);
                Some(ProtocolCommand::TurnOn)
            }
            DeviceAction::TurnOff => {
                self.status.set_on(&sub.device, false);
                Some(ProtocolCommand::TurnOff)
            }
            ref other => {
                warn!("unknown {protocol} action for device [{}]: {other}", sub.device);
                None
            }
        }
    }

    async fn resolve_wled_dial<S: BrightnessSource + Sync>(
        &self,
        sub: &SubAction,
        source: &S,
    ) -> Option<ProtocolCommand> {
        match sub.action {
            DeviceAction::TurnOn => {
                self.status.set_on(&sub.device, true);
                Some(ProtocolCommand::TurnOn)
            }
            DeviceAction::TurnOff => {
                self.status.set_on(&sub.device, false);
                Some(ProtocolCommand::TurnOff)
            }
            DeviceAction::SetBrightness => {
                let percent = sub.value.unwrap_or(DEFAULT_SET_BRIGHTNESS).clamp(0, 100);
                Some(self.wled_brightness_command(&sub.device, percent).await)
            }
            DeviceAction::IncreaseBrightness => {
                let step = sub.value.unwrap_or(DEFAULT_BRIGHTNESS_STEP);
                let current = self.current_wled_brightness(&sub.device, source).await;
                let percent = (current + step).clamp(0, 100);
                Some(self.wled_brightness_command(&sub.device, percent).await)
            }
            DeviceAction::DecreaseBrightness => {
                let step = sub.value.unwrap_or(DEFAULT_BRIGHTNESS_STEP);
                let current = self.current_wled_brightness(&sub.device, source).await;
                let percent = (current - step).clamp(0, 100);
                Some(self.wled_brightness_command(&sub.device, percent).await)
            }
            ref other => {
                warn!("unknown WLED action for device [{}]: {other}", sub.device);
                None
            }
        }
    }

    async fn current_wled_brightness<S: BrightnessSource + Sync>(
        &self,
        device: &str,
        source: &S,
    ) -> i64 {
        self.brightness
            .get_or_fetch(device, |name: String| async move {
                source.device_brightness(&name).await
            })
            .await
    }

    /// Record the percent level and emit the native-scale WLED command.
    async fn wled_brightness_command(&self, device: &str, percent: i64) -> ProtocolCommand {
        self.brightness.set_for_device(device, percent).await;
        self.status.set_brightness(device, percent as i32);
        ProtocolCommand::SetBrightness(mapping::linear_map(percent, [0, 100], [0, 255]))
    }

    /// Resolve an on/off transition of a synced light. Sub-actions gate on
    /// their sync value: `on-off` follows both directions, `on` and `off`
    /// only their own.
    pub fn on_light_power(&self, light: &str, on: bool) -> OutboundBatch {
        let mut batch = OutboundBatch::default();

        for action in &self.configuration.actions {
            if action.trigger != ActionTrigger::LightSync || action.light_name != light {
                continue;
            }
            for (subs, commands) in [
                (&action.govee_actions, &mut batch.govee),
                (&action.twinkly_actions, &mut batch.twinkly),
                (&action.switchbot_actions, &mut batch.switchbot),
                (&action.wled_actions, &mut batch.wled),
            ] {
                for sub in subs {
                    if let Some(command) = self.resolve_synced_power(sub, on) {
                        commands.push(OutboundCommand::new(&sub.device, command));
                    }
                }
            }
        }

        batch
    }

    fn resolve_synced_power(&self, sub: &SubAction, on: bool) -> Option<ProtocolCommand> {
        let fire = match sub.sync_value {
            Some(SyncValue::OnOff) => true,
            Some(SyncValue::On) => on,
            Some(SyncValue::Off) => !on,
            _ => false,
        };
        if !fire {
            return None;
        }
        self.status.set_on(&sub.device, on);
        if on {
            Some(ProtocolCommand::TurnOn)
        } else {
            Some(ProtocolCommand::TurnOff)
        }
    }

    /// Resolve a brightness change of a synced light. `percent` is 0-100;
    /// each sub-action may remap it into its `brightness_range` window.
    pub fn on_light_brightness(&self, light: &str, percent: i64) -> OutboundBatch {
        let mut batch = OutboundBatch::default();

        for action in &self.configuration.actions {
            if action.trigger != ActionTrigger::LightSync || action.light_name != light {
                continue;
            }
            for sub in &action.govee_actions {
                if sub.sync_value != Some(SyncValue::Brightness) {
                    continue;
                }
                let adjusted = self.adjusted_brightness(sub, percent);
                self.status.set_brightness(&sub.device, adjusted as i32);
                batch.govee.push(OutboundCommand::new(
                    &sub.device,
                    ProtocolCommand::SetBrightness(adjusted),
                ));
            }
            for sub in &action.switchbot_actions {
                if sub.sync_value != Some(SyncValue::Brightness) {
                    continue;
                }
                let adjusted = self.adjusted_brightness(sub, percent);
                self.status.set_brightness(&sub.device, adjusted as i32);
                batch.switchbot.push(OutboundCommand::new(
                    &sub.device,
                    ProtocolCommand::SetBrightness(adjusted),
                ));
            }
            for sub in &action.wled_actions {
                if sub.sync_value != Some(SyncValue::Brightness) {
                    continue;
                }
                let adjusted = self.adjusted_brightness(sub, percent);
                self.status.set_brightness(&sub.device, adjusted as i32);
                batch.wled.push(OutboundCommand::new(
                    &sub.device,
                    ProtocolCommand::SetBrightness(mapping::linear_map(
                        adjusted,
                        [0, 100],
                        [0, 255],
                    )),
                ));
            }
        }

        batch
    }

    fn adjusted_brightness(&self, sub: &SubAction, percent: i64) -> i64 {
        match sub.brightness_window() {
            Some(window) => mapping::range_remap(percent, window),
            None => percent,
        }
    }

    /// Resolve a color change of a synced light. Only Govee devices carry
    /// color.
    pub fn on_light_color(&self, light: &str, r: u8, g: u8, b: u8) -> OutboundBatch {
        let mut batch = OutboundBatch::default();

        for action in &self.configuration.actions {
            if action.trigger != ActionTrigger::LightSync || action.light_name != light {
                continue;
            }
            for sub in &action.govee_actions {
                if sub.sync_value != Some(SyncValue::Color) {
                    continue;
                }
                self.status.set_on(&sub.device, true);
                self.status.set_color(&sub.device, r, g, b);
                batch.govee.push(OutboundCommand::new(
                    &sub.device,
                    ProtocolCommand::SetColor { r, g, b },
                ));
            }
        }

        batch
    }

    /// Resolve a presence transition: turn-on sub-actions fire when the
    /// sensor reports presence, turn-off sub-actions when it clears.
    pub fn on_presence_changed(&self, sensor: &str, present: bool) -> OutboundBatch {
        let mut batch = OutboundBatch::default();

        for action in &self.configuration.actions {
            if action.trigger != ActionTrigger::PresenceSensor
                || action.presence_sensor_name != sensor
            {
                continue;
            }
            for (subs, commands) in [
                (&action.govee_actions, &mut batch.govee),
                (&action.twinkly_actions, &mut batch.twinkly),
                (&action.switchbot_actions, &mut batch.switchbot),
                (&action.wled_actions, &mut batch.wled),
            ] {
                for sub in subs {
                    let command = match (&sub.action, present) {
                        (DeviceAction::TurnOn, true) => {
                            self.status.set_on(&sub.device, true);
                            ProtocolCommand::TurnOn
                        }
                        (DeviceAction::TurnOff, false) => {
                            self.status.set_on(&sub.device, false);
                            ProtocolCommand::TurnOff
                        }
                        (DeviceAction::TurnOn, false) | (DeviceAction::TurnOff, true) => continue,
                        (other, _) => {
                            warn!(
                                "unknown presence action for device [{}]: {other}",
                                sub.device
                            );
                            continue;
                        }
                    };
                    commands.push(OutboundCommand::new(&sub.device, command));
                }
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBrightness(i64);

    impl BrightnessSource for FixedBrightness {
        async fn device_brightness(&self, _device: &str) -> Result<i64, Error> {
            Ok(self.0)
        }
    }

    struct FailingBrightness;

    impl BrightnessSource for FailingBrightness {
        async fn device_brightness(&self, device: &str) -> Result<i64, Error> {
            Err(Error::DeviceNotFound(device.to_string()))
        }
    }

    fn resolver(raw: &str) -> ActionResolver {
        ActionResolver::new(
            Arc::new(Configuration::parse(raw).unwrap()),
            Arc::new(StatusStore::new()),
            Arc::new(BrightnessCache::new()),
        )
    }

    const DIAL_CONFIG: &str = r#"{
        "actions": [
            {
                "trigger": "hue tap dial button press",
                "dial_name": "Desk",
                "hue_tap_dial_buttons": [1002, 4002],
                "govee_actions": [{"device": "Lamp", "action": "turn on"}],
                "wled_actions": [
                    {"device": "Strip", "action": "increase brightness", "value": 10}
                ]
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_dial_press_resolves_govee_turn_on() {
        let resolver = resolver(DIAL_CONFIG);
        let batch = resolver
            .on_button_pressed("Desk", 1002, &FixedBrightness(40))
            .await;
        assert_eq!(
            batch.govee,
            vec![OutboundCommand::new("Lamp", ProtocolCommand::TurnOn)]
        );
        assert_eq!(resolver.status.snapshot()["Lamp"].on, 1);
    }

    #[tokio::test]
    async fn test_dial_press_unmatched_button_resolves_nothing() {
        let resolver = resolver(DIAL_CONFIG);
        let batch = resolver
            .on_button_pressed("Desk", 3002, &FixedBrightness(40))
            .await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_wled_increase_starts_from_fetched_brightness() {
        let resolver = resolver(DIAL_CONFIG);
        let batch = resolver
            .on_button_pressed("Desk", 1002, &FixedBrightness(40))
            .await;
        // 40 + 10 = 50 percent, sent to WLED as 128.
        assert_eq!(
            batch.wled,
            vec![OutboundCommand::new(
                "Strip",
                ProtocolCommand::SetBrightness(128)
            )]
        );
        assert_eq!(resolver.brightness.get("Strip").await, 50);
        assert_eq!(resolver.status.snapshot()["Strip"].brightness, 50);
    }

    #[tokio::test]
    async fn test_wled_increase_falls_back_to_default_on_fetch_error() {
        let resolver = resolver(DIAL_CONFIG);
        let batch = resolver
            .on_button_pressed("Desk", 1002, &FailingBrightness)
            .await;
        // Default 50 + 10 = 60 percent.
        assert_eq!(
            batch.wled,
            vec![OutboundCommand::new(
                "Strip",
                ProtocolCommand::SetBrightness(153)
            )]
        );
    }

    #[tokio::test]
    async fn test_wled_brightness_is_clamped() {
        let resolver = resolver(DIAL_CONFIG);
        resolver.brightness.set_for_device("Strip", 95).await;
        let batch = resolver
            .on_button_pressed("Desk", 1002, &FixedBrightness(0))
            .await;
        assert_eq!(
            batch.wled,
            vec![OutboundCommand::new(
                "Strip",
                ProtocolCommand::SetBrightness(255)
            )]
        );
        assert_eq!(resolver.brightness.get("Strip").await, 100);
    }

    #[tokio::test]
    async fn test_wled_decrease_is_clamped_at_zero() {
        let resolver = resolver(
            r#"{
                "actions": [
                    {
                        "trigger": "hue tap dial button press",
                        "dial_name": "Desk",
                        "hue_tap_dial_buttons": [4002],
                        "wled_actions": [
                            {"device": "Strip", "action": "decrease brightness", "value": 10}
                        ]
                    }
                ]
            }"#,
        );
        resolver.brightness.set_for_device("Strip", 5).await;
        let batch = resolver
            .on_button_pressed("Desk", 4002, &FixedBrightness(0))
            .await;
        assert_eq!(
            batch.wled,
            vec![OutboundCommand::new(
                "Strip",
                ProtocolCommand::SetBrightness(0)
            )]
        );
        assert_eq!(resolver.brightness.get("Strip").await, 0);
        assert_eq!(resolver.status.snapshot()["Strip"].brightness, 0);
    }

    const SYNC_CONFIG: &str = r#"{
        "actions": [
            {
                "trigger": "hue light sync",
                "light_name": "Soggiorno",
                "govee_actions": [
                    {"device": "Lamp", "sync_value": "on-off"},
                    {"device": "Lamp", "sync_value": "brightness", "brightness_range": [20, 80]},
                    {"device": "Lamp", "sync_value": "color"}
                ],
                "switchbot_actions": [
                    {"device": "Plug", "sync_value": "on"}
                ],
                "wled_actions": [
                    {"device": "Strip", "sync_value": "brightness"}
                ]
            }
        ]
    }"#;

    #[test]
    fn test_light_power_respects_sync_direction() {
        let resolver = resolver(SYNC_CONFIG);

        let batch = resolver.on_light_power("Soggiorno", true);
        assert_eq!(
            batch.govee,
            vec![OutboundCommand::new("Lamp", ProtocolCommand::TurnOn)]
        );
        // `on` sync value fires only on the rising edge.
        assert_eq!(
            batch.switchbot,
            vec![OutboundCommand::new("Plug", ProtocolCommand::TurnOn)]
        );

        let batch = resolver.on_light_power("Soggiorno", false);
        assert_eq!(
            batch.govee,
            vec![OutboundCommand::new("Lamp", ProtocolCommand::TurnOff)]
        );
        assert!(batch.switchbot.is_empty());
    }

    #[test]
    fn test_light_brightness_range_remap() {
        let resolver = resolver(SYNC_CONFIG);
        let batch = resolver.on_light_brightness("Soggiorno", 50);
        // Govee window [20, 80]: 50 percent lands on 50.
        assert_eq!(
            batch.govee,
            vec![OutboundCommand::new(
                "Lamp",
                ProtocolCommand::SetBrightness(50)
            )]
        );
        // WLED has no window; 50 percent maps to native 128.
        assert_eq!(
            batch.wled,
            vec![OutboundCommand::new(
                "Strip",
                ProtocolCommand::SetBrightness(128)
            )]
        );
    }

    #[test]
    fn test_light_color_targets_govee_only() {
        let resolver = resolver(SYNC_CONFIG);
        let batch = resolver.on_light_color("Soggiorno", 10, 20, 30);
        assert_eq!(
            batch.govee,
            vec![OutboundCommand::new(
                "Lamp",
                ProtocolCommand::SetColor { r: 10, g: 20, b: 30 }
            )]
        );
        assert!(batch.wled.is_empty() && batch.switchbot.is_empty());
        let status = resolver.status.snapshot();
        assert_eq!(status["Lamp"].on, 1);
        assert_eq!(status["Lamp"].color.r, 10);
    }

    #[test]
    fn test_unknown_light_resolves_nothing() {
        let resolver = resolver(SYNC_CONFIG);
        assert!(resolver.on_light_power("Cucina", true).is_empty());
    }

    #[test]
    fn test_presence_direction_selects_sub_actions() {
        let resolver = resolver(
            r#"{
                "actions": [
                    {
                        "trigger": "presence sensor",
                        "presence_sensor_name": "Hallway",
                        "wled_actions": [
                            {"device": "Strip", "action": "turn on"},
                            {"device": "Strip", "action": "turn off"}
                        ]
                    }
                ]
            }"#,
        );

        let batch = resolver.on_presence_changed("Hallway", true);
        assert_eq!(
            batch.wled,
            vec![OutboundCommand::new("Strip", ProtocolCommand::TurnOn)]
        );

        let batch = resolver.on_presence_changed("Hallway", false);
        assert_eq!(
            batch.wled,
            vec![OutboundCommand::new("Strip", ProtocolCommand::TurnOff)]
        );
    }

    #[tokio::test]
    async fn test_unknown_action_is_skipped() {
        let resolver = resolver(
            r#"{
                "actions": [
                    {
                        "trigger": "hue tap dial button press",
                        "dial_name": "Desk",
                        "hue_tap_dial_buttons": [1002],
                        "govee_actions": [
                            {"device": "Lamp", "action": "explode"},
                            {"device": "Lamp", "action": "turn off"}
                        ]
                    }
                ]
            }"#,
        );
        let batch = resolver
            .on_button_pressed("Desk", 1002, &FixedBrightness(0))
            .await;
        assert_eq!(
            batch.govee,
            vec![OutboundCommand::new("Lamp", ProtocolCommand::TurnOff)]
        );
    }
}
