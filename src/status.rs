//! Last-known device status tracking, exposed read-only over HTTP.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

/// Last-known RGB color of a device. `-1` components mean "never observed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceColor {
    pub r: i32,
    pub g: i32,
    pub b: i32,
}

/// Last-known state of one downstream device.
///
/// `on` is `-1` unknown, `0` off, `1` on; `brightness` is `-1` unknown or a
/// 0-100 percentage. The sentinel encoding is part of the status endpoint's
/// JSON contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub provider: String,
    pub on: i32,
    pub brightness: i32,
    pub color: DeviceColor,
}

impl DeviceStatus {
    fn unknown(provider: &str) -> Self {
        DeviceStatus {
            provider: provider.to_string(),
            on: -1,
            brightness: -1,
            color: DeviceColor {
                r: -1,
                g: -1,
                b: -1,
            },
        }
    }
}

/// Cross-device status store. One per process, constructed at startup and
/// shared by reference with everything that reports state.
#[derive(Debug, Default)]
pub struct StatusStore {
    statuses: RwLock<HashMap<String, DeviceStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device with all-unknown state. Re-registration keeps the
    /// existing entry.
    pub fn register(&self, device: &str, provider: &str) {
        let mut statuses = self.statuses.write().unwrap();
        statuses
            .entry(device.to_string())
            .or_insert_with(|| DeviceStatus::unknown(provider));
    }

    pub fn set_on(&self, device: &str, on: bool) {
        let mut statuses = self.statuses.write().unwrap();
        let status = statuses
            .entry(device.to_string())
            .or_insert_with(|| DeviceStatus::unknown(""));
        status.on = if on { 1 } else { 0 };
    }

    pub fn set_brightness(&self, device: &str, brightness: i32) {
        let mut statuses = self.statuses.write().unwrap();
        let status = statuses
            .entry(device.to_string())
            .or_insert_with(|| DeviceStatus::unknown(""));
        status.brightness = brightness;
    }

    pub fn set_color(&self, device: &str, r: u8, g: u8, b: u8) {
        let mut statuses = self.statuses.write().unwrap();
        let status = statuses
            .entry(device.to_string())
            .or_insert_with(|| DeviceStatus::unknown(""));
        status.color = DeviceColor {
            r: i32::from(r),
            g: i32::from(g),
            b: i32::from(b),
        };
    }

    /// A cloned view of every device's status.
    pub fn snapshot(&self) -> HashMap<String, DeviceStatus> {
        self.statuses.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_defaults_to_unknown() {
        let store = StatusStore::new();
        store.register("Lamp", "govee");

        let snapshot = store.snapshot();
        let status = &snapshot["Lamp"];
        assert_eq!(status.provider, "govee");
        assert_eq!(status.on, -1);
        assert_eq!(status.brightness, -1);
        assert_eq!(status.color, DeviceColor { r: -1, g: -1, b: -1 });
    }

    #[test]
    fn test_register_does_not_reset_existing_state() {
        let store = StatusStore::new();
        store.register("Lamp", "govee");
        store.set_on("Lamp", true);
        store.register("Lamp", "govee");

        assert_eq!(store.snapshot()["Lamp"].on, 1);
    }

    #[test]
    fn test_updates() {
        let store = StatusStore::new();
        store.register("Strip", "wled");
        store.set_on("Strip", false);
        store.set_brightness("Strip", 42);
        store.set_color("Strip", 255, 128, 0);

        let snapshot = store.snapshot();
        let status = &snapshot["Strip"];
        assert_eq!(status.on, 0);
        assert_eq!(status.brightness, 42);
        assert_eq!(
            status.color,
            DeviceColor {
                r: 255,
                g: 128,
                b: 0
            }
        );
    }
}
