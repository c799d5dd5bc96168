//! Hub state polling and stateful change detection.
//!
//! The poller fetches the hub's full state every 200 ms, diffs each tracked
//! entity against its previously observed snapshot and pushes trigger events
//! into the per-category queues. Entities are tracked only when some
//! configured action references them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use serde::Deserialize;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::brightness::BrightnessCache;
use crate::color::{self, Gamut};
use crate::config::Configuration;
use crate::errors::Error;
use crate::events::{EventQueues, TriggerEvent};
use crate::mapping;

type Result<T> = std::result::Result<T, Error>;

/// How often the full hub state is fetched and diffed.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How often the hub's sensor inventory is refreshed.
const SENSOR_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// The hub reports a dial that has never fired with this timestamp.
const TIMESTAMP_NONE: &str = "none";

// ---------------------------------------------------------------------------
// Typed partial schema for the hub's full-state response. Only the fields
// change detection needs are declared; everything else is ignored. Absence of
// a required field is a per-entity decode error, never a panic.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubState {
    #[serde(default)]
    pub sensors: HashMap<String, HubSensor>,
    #[serde(default)]
    pub lights: HashMap<String, HubLight>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubSensor {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub state: Option<HubSensorState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubSensorState {
    pub lastupdated: Option<String>,
    pub buttonevent: Option<f64>,
    pub presence: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubLight {
    pub name: Option<String>,
    pub state: Option<HubLightState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubLightState {
    pub on: Option<bool>,
    pub bri: Option<f64>,
    pub xy: Option<Vec<f64>>,
}

/// Where the poller gets the hub's state from. The production implementation
/// is [`HueBridge`]; tests substitute a canned source.
pub trait HubStateSource {
    fn full_state(&self) -> impl Future<Output = Result<HubState>> + Send;
    fn sensors(&self) -> impl Future<Output = Result<HashMap<String, HubSensor>>> + Send;
}

/// HTTP client for a Hue-style bridge.
pub struct HueBridge {
    client: reqwest::Client,
    base_url: String,
}

impl HueBridge {
    pub fn new(bridge_ip: &str, username: &str) -> Self {
        HueBridge {
            client: reqwest::Client::new(),
            base_url: format!("http://{bridge_ip}/api/{username}"),
        }
    }
}

impl HubStateSource for HueBridge {
    async fn full_state(&self) -> Result<HubState> {
        let state = self
            .client
            .get(&self.base_url)
            .send()
            .await?
            .error_for_status()?
            .json::<HubState>()
            .await?;
        Ok(state)
    }

    async fn sensors(&self) -> Result<HashMap<String, HubSensor>> {
        let sensors = self
            .client
            .get(format!("{}/sensors", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json::<HashMap<String, HubSensor>>()
            .await?;
        Ok(sensors)
    }
}

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DialSnapshot {
    last_updated: String,
    button_event: f64,
}

#[derive(Debug, Clone)]
struct PresenceSnapshot {
    last_updated: String,
    present: bool,
}

#[derive(Debug, Clone)]
struct LightSnapshot {
    on: bool,
    brightness: i64,
    x: f64,
    y: f64,
}

/// What one diff pass produced: the events to dispatch plus every light
/// brightness that was observed this tick (written through to the
/// brightness cache by the poller).
#[derive(Debug, Default)]
pub struct DetectOutcome {
    pub events: Vec<TriggerEvent>,
    pub observed_brightness: Vec<(String, i64)>,
}

/// Stateful diff of hub snapshots across poll ticks.
///
/// Lights follow the "last-fired-wins" policy: when several state dimensions
/// changed in the same tick, only the highest-priority one (on/off, then
/// brightness, then color) fires and only its snapshot fields are updated.
/// The remaining diffs fire on the following ticks. This guarantees at most
/// one dispatch per entity per tick.
pub struct ChangeDetector {
    configuration: Arc<Configuration>,
    tracked_dials: std::collections::HashSet<String>,
    gamut: Gamut,
    dials: HashMap<String, DialSnapshot>,
    presence: HashMap<String, PresenceSnapshot>,
    lights: HashMap<String, LightSnapshot>,
}

impl ChangeDetector {
    pub fn new(configuration: Arc<Configuration>) -> Self {
        ChangeDetector {
            tracked_dials: configuration.required_dials(),
            configuration,
            gamut: Gamut::HUE_C,
            dials: HashMap::new(),
            presence: HashMap::new(),
            lights: HashMap::new(),
        }
    }

    /// Diff one full hub state against the stored snapshots.
    pub fn detect(&mut self, state: &HubState) -> DetectOutcome {
        let mut outcome = DetectOutcome::default();

        for sensor in state.sensors.values() {
            let Some(name) = sensor.name.as_deref() else {
                continue;
            };
            if self.tracked_dials.contains(name) {
                if let Err(err) = self.detect_dial(name, sensor, &mut outcome) {
                    error!("skipping dial [{name}] this tick: {err}");
                }
            } else if self.configuration.tracks_presence_sensor(name) {
                if let Err(err) = self.detect_presence(name, sensor, &mut outcome) {
                    error!("skipping presence sensor [{name}] this tick: {err}");
                }
            }
        }

        for light in state.lights.values() {
            let Some(name) = light.name.as_deref() else {
                continue;
            };
            if !self.configuration.tracks_light(name) {
                continue;
            }
            if let Err(err) = self.detect_light(name, light, &mut outcome) {
                error!("skipping light [{name}] this tick: {err}");
            }
        }

        outcome
    }

    fn detect_dial(
        &mut self,
        name: &str,
        sensor: &HubSensor,
        outcome: &mut DetectOutcome,
    ) -> Result<()> {
        let state = sensor
            .state
            .as_ref()
            .ok_or_else(|| Error::entity_decode(name, "state"))?;
        let last_updated = state
            .lastupdated
            .as_deref()
            .ok_or_else(|| Error::entity_decode(name, "lastupdated"))?;
        if last_updated == TIMESTAMP_NONE || last_updated.is_empty() {
            // The dial has never fired; nothing to diff.
            return Ok(());
        }
        let button_event = state
            .buttonevent
            .ok_or_else(|| Error::entity_decode(name, "buttonevent"))?;

        match self.dials.get_mut(name) {
            None => {
                // First observation is a baseline, not a press.
                self.dials.insert(
                    name.to_string(),
                    DialSnapshot {
                        last_updated: last_updated.to_string(),
                        button_event,
                    },
                );
            }
            Some(snapshot) => {
                if snapshot.last_updated == last_updated && snapshot.button_event == button_event {
                    return Ok(());
                }
                snapshot.last_updated = last_updated.to_string();
                snapshot.button_event = button_event;

                debug!("Button [{}] pressed on dial [{name}]", button_event as i64);
                outcome.events.push(TriggerEvent::ButtonPressed {
                    dial: name.to_string(),
                    code: button_event as i64,
                });
            }
        }
        Ok(())
    }

    fn detect_presence(
        &mut self,
        name: &str,
        sensor: &HubSensor,
        outcome: &mut DetectOutcome,
    ) -> Result<()> {
        let state = sensor
            .state
            .as_ref()
            .ok_or_else(|| Error::entity_decode(name, "state"))?;
        let last_updated = state
            .lastupdated
            .as_deref()
            .ok_or_else(|| Error::entity_decode(name, "lastupdated"))?;
        if last_updated == TIMESTAMP_NONE || last_updated.is_empty() {
            return Ok(());
        }
        let present = state
            .presence
            .ok_or_else(|| Error::entity_decode(name, "presence"))?;

        match self.presence.get_mut(name) {
            None => {
                self.presence.insert(
                    name.to_string(),
                    PresenceSnapshot {
                        last_updated: last_updated.to_string(),
                        present,
                    },
                );
            }
            Some(snapshot) => {
                if snapshot.last_updated == last_updated && snapshot.present == present {
                    return Ok(());
                }
                snapshot.last_updated = last_updated.to_string();
                snapshot.present = present;

                debug!("Presence on sensor [{name}] changed to [{present}]");
                outcome.events.push(TriggerEvent::PresenceChanged {
                    sensor: name.to_string(),
                    present,
                });
            }
        }
        Ok(())
    }

    fn detect_light(
        &mut self,
        name: &str,
        light: &HubLight,
        outcome: &mut DetectOutcome,
    ) -> Result<()> {
        let state = light
            .state
            .as_ref()
            .ok_or_else(|| Error::entity_decode(name, "state"))?;
        let on = state.on.ok_or_else(|| Error::entity_decode(name, "on"))?;
        let raw_brightness = state.bri.ok_or_else(|| Error::entity_decode(name, "bri"))?;
        let brightness = mapping::percent_from_native(raw_brightness);
        let (x, y) = match state.xy.as_deref() {
            Some(&[x, y]) => (x, y),
            _ => return Err(Error::entity_decode(name, "xy")),
        };

        outcome.observed_brightness.push((name.to_string(), brightness));

        match self.lights.get_mut(name) {
            None => {
                // Initial full sync: power and color resolve together.
                let (r, g, b) = color::xy_to_rgb(x, y, raw_brightness / 255.0, self.gamut);
                debug!(
                    "Light [{name}] initial state [on: {on}, bri: {brightness}, xy:<{x},{y}>, rgb:<{r},{g},{b}>]"
                );
                self.lights.insert(
                    name.to_string(),
                    LightSnapshot {
                        on,
                        brightness,
                        x,
                        y,
                    },
                );
                outcome.events.push(TriggerEvent::LightPower {
                    light: name.to_string(),
                    on,
                });
                outcome.events.push(TriggerEvent::LightColor {
                    light: name.to_string(),
                    r,
                    g,
                    b,
                });
            }
            Some(snapshot) => {
                if snapshot.on != on {
                    debug!("Light [{name}] state changed to [on: {on}]");
                    snapshot.on = on;
                    outcome.events.push(TriggerEvent::LightPower {
                        light: name.to_string(),
                        on,
                    });
                } else if snapshot.brightness != brightness {
                    debug!("Light [{name}] state changed to [bri: {brightness}]");
                    snapshot.brightness = brightness;
                    outcome.events.push(TriggerEvent::LightBrightness {
                        light: name.to_string(),
                        percent: brightness,
                    });
                } else if snapshot.x != x || snapshot.y != y {
                    let (r, g, b) = color::xy_to_rgb(x, y, raw_brightness / 255.0, self.gamut);
                    debug!("Light [{name}] state changed to [xy:<{x},{y}>, rgb:<{r},{g},{b}>]");
                    snapshot.x = x;
                    snapshot.y = y;
                    outcome.events.push(TriggerEvent::LightColor {
                        light: name.to_string(),
                        r,
                        g,
                        b,
                    });
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Poller tasks
// ---------------------------------------------------------------------------

/// The hub polling loop: fetch, diff, enqueue, sleep. Ticks are strictly
/// sequential and never overlap; fetch failures skip the tick.
pub struct HubPoller<S> {
    source: S,
    detector: ChangeDetector,
    brightness: Arc<BrightnessCache>,
    queues: EventQueues,
}

impl<S: HubStateSource> HubPoller<S> {
    pub fn new(
        source: S,
        configuration: Arc<Configuration>,
        brightness: Arc<BrightnessCache>,
        queues: EventQueues,
    ) -> Self {
        HubPoller {
            source,
            detector: ChangeDetector::new(configuration),
            brightness,
            queues,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = time::sleep(POLL_INTERVAL) => {}
            }

            let state = match self.source.full_state().await {
                Ok(state) => state,
                Err(err) => {
                    error!("cannot get full hub state: {err}");
                    continue;
                }
            };

            let outcome = self.detector.detect(&state);
            for (light, percent) in outcome.observed_brightness {
                self.brightness.set_for_device(&light, percent).await;
            }
            for event in outcome.events {
                self.queues.push(event);
            }
        }
    }
}

/// Periodically refresh the hub's sensor inventory, logging configured dials
/// as they appear.
pub async fn run_sensor_inventory<S: HubStateSource>(
    source: S,
    configuration: Arc<Configuration>,
    cancel: CancellationToken,
) {
    let required = configuration.required_dials();
    let mut first_look = true;
    let mut seen: Vec<String> = Vec::new();

    loop {
        match source.sensors().await {
            Ok(sensors) => {
                for sensor in sensors.values() {
                    let Some(name) = sensor.name.as_deref() else {
                        continue;
                    };
                    if first_look {
                        debug!("Found hub sensor [{name}]");
                    }
                    if required.contains(name) && !seen.iter().any(|s| s == name) {
                        info!(
                            "Tracking dial [{name}] (type {})",
                            sensor.kind.as_deref().unwrap_or("unknown")
                        );
                        seen.push(name.to_string());
                    }
                }
            }
            Err(err) => error!("error retrieving sensors: {err}"),
        }
        first_look = false;

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = time::sleep(SENSOR_REFRESH_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configuration() -> Arc<Configuration> {
        Arc::new(
            Configuration::parse(
                r#"{
                    "actions": [
                        {
                            "trigger": "hue tap dial button press",
                            "dial_name": "Desk",
                            "hue_tap_dial_buttons": [1002]
                        },
                        {
                            "trigger": "hue light sync",
                            "light_name": "Soggiorno"
                        },
                        {
                            "trigger": "presence sensor",
                            "presence_sensor_name": "Hallway"
                        }
                    ]
                }"#,
            )
            .unwrap(),
        )
    }

    fn state(value: serde_json::Value) -> HubState {
        serde_json::from_value(value).unwrap()
    }

    fn dial_state(lastupdated: &str, buttonevent: f64) -> HubState {
        state(json!({
            "sensors": {
                "1": {
                    "name": "Desk",
                    "type": "ZLLSwitch",
                    "state": {"lastupdated": lastupdated, "buttonevent": buttonevent}
                }
            }
        }))
    }

    fn light_state(on: bool, bri: f64, x: f64, y: f64) -> HubState {
        state(json!({
            "lights": {
                "1": {
                    "name": "Soggiorno",
                    "state": {"on": on, "bri": bri, "xy": [x, y]}
                }
            }
        }))
    }

    #[test]
    fn test_dial_first_observation_does_not_fire() {
        let mut detector = ChangeDetector::new(configuration());
        let outcome = detector.detect(&dial_state("2026-01-01T10:00:00", 1002.0));
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_dial_change_fires_once() {
        let mut detector = ChangeDetector::new(configuration());
        detector.detect(&dial_state("2026-01-01T10:00:00", 1002.0));

        let outcome = detector.detect(&dial_state("2026-01-01T10:00:05", 1002.0));
        assert_eq!(
            outcome.events,
            vec![TriggerEvent::ButtonPressed {
                dial: "Desk".into(),
                code: 1002
            }]
        );

        // Unchanged timestamp and code: no further events.
        for _ in 0..3 {
            let outcome = detector.detect(&dial_state("2026-01-01T10:00:05", 1002.0));
            assert!(outcome.events.is_empty());
        }
    }

    #[test]
    fn test_dial_none_timestamp_is_skipped() {
        let mut detector = ChangeDetector::new(configuration());
        let outcome = detector.detect(&dial_state("none", 0.0));
        assert!(outcome.events.is_empty());
        // A later real timestamp becomes the baseline, still without firing.
        let outcome = detector.detect(&dial_state("2026-01-01T10:00:00", 1002.0));
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_untracked_sensor_is_ignored() {
        let mut detector = ChangeDetector::new(configuration());
        let hub_state = state(json!({
            "sensors": {
                "9": {
                    "name": "SomeOtherDial",
                    "state": {"lastupdated": "2026-01-01T10:00:00", "buttonevent": 1002.0}
                }
            }
        }));
        detector.detect(&hub_state);
        let outcome = detector.detect(&hub_state);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_presence_debounce() {
        let mut detector = ChangeDetector::new(configuration());
        let present = |lastupdated: &str, present: bool| {
            state(json!({
                "sensors": {
                    "2": {
                        "name": "Hallway",
                        "state": {"lastupdated": lastupdated, "presence": present}
                    }
                }
            }))
        };

        assert!(detector.detect(&present("2026-01-01T10:00:00", false)).events.is_empty());
        let outcome = detector.detect(&present("2026-01-01T10:00:05", true));
        assert_eq!(
            outcome.events,
            vec![TriggerEvent::PresenceChanged {
                sensor: "Hallway".into(),
                present: true
            }]
        );
        assert!(detector.detect(&present("2026-01-01T10:00:05", true)).events.is_empty());
    }

    #[test]
    fn test_light_first_observation_emits_power_and_color() {
        let mut detector = ChangeDetector::new(configuration());
        let outcome = detector.detect(&light_state(true, 255.0, 0.3, 0.3));
        assert_eq!(outcome.events.len(), 2);
        assert!(matches!(
            outcome.events[0],
            TriggerEvent::LightPower { on: true, .. }
        ));
        assert!(matches!(outcome.events[1], TriggerEvent::LightColor { .. }));
        assert_eq!(outcome.observed_brightness, vec![("Soggiorno".into(), 100)]);
    }

    #[test]
    fn test_light_one_category_per_tick_with_priority() {
        let mut detector = ChangeDetector::new(configuration());
        detector.detect(&light_state(true, 255.0, 0.3, 0.3));

        // Everything changed at once: only on/off fires.
        let outcome = detector.detect(&light_state(false, 127.5, 0.4, 0.4));
        assert_eq!(
            outcome.events,
            vec![TriggerEvent::LightPower {
                light: "Soggiorno".into(),
                on: false
            }]
        );

        // Next tick: brightness still differs from the snapshot and fires.
        let outcome = detector.detect(&light_state(false, 127.5, 0.4, 0.4));
        assert_eq!(
            outcome.events,
            vec![TriggerEvent::LightBrightness {
                light: "Soggiorno".into(),
                percent: 50
            }]
        );

        // Then the deferred color change.
        let outcome = detector.detect(&light_state(false, 127.5, 0.4, 0.4));
        assert_eq!(outcome.events.len(), 1);
        assert!(matches!(outcome.events[0], TriggerEvent::LightColor { .. }));

        // Fully converged.
        let outcome = detector.detect(&light_state(false, 127.5, 0.4, 0.4));
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_light_missing_field_is_skipped_without_panic() {
        let mut detector = ChangeDetector::new(configuration());
        let hub_state = state(json!({
            "lights": {
                "1": {"name": "Soggiorno", "state": {"on": true, "bri": 100.0}}
            }
        }));
        let outcome = detector.detect(&hub_state);
        assert!(outcome.events.is_empty());
    }
}
