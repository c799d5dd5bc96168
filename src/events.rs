//! Trigger events and the per-category queues between detection and dispatch.

use log::warn;
use tokio::sync::mpsc;

/// A dispatch-worthy transition detected on the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEvent {
    ButtonPressed { dial: String, code: i64 },
    PresenceChanged { sensor: String, present: bool },
    LightPower { light: String, on: bool },
    LightBrightness { light: String, percent: i64 },
    LightColor { light: String, r: u8, g: u8, b: u8 },
}

impl TriggerEvent {
    /// The queue this event is routed to.
    pub fn category(&self) -> EventCategory {
        match self {
            TriggerEvent::ButtonPressed { .. } => EventCategory::Button,
            TriggerEvent::PresenceChanged { .. } => EventCategory::Presence,
            TriggerEvent::LightPower { .. }
            | TriggerEvent::LightBrightness { .. }
            | TriggerEvent::LightColor { .. } => EventCategory::Light,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Button,
    Presence,
    Light,
}

/// Sending half of the three category queues, owned by the poller.
#[derive(Clone)]
pub struct EventQueues {
    button: mpsc::Sender<TriggerEvent>,
    presence: mpsc::Sender<TriggerEvent>,
    light: mpsc::Sender<TriggerEvent>,
}

/// Receiving half, one receiver per dispatch worker.
pub struct EventReceivers {
    pub button: mpsc::Receiver<TriggerEvent>,
    pub presence: mpsc::Receiver<TriggerEvent>,
    pub light: mpsc::Receiver<TriggerEvent>,
}

impl EventQueues {
    /// Create the three bounded category queues.
    pub fn bounded(capacity: usize) -> (EventQueues, EventReceivers) {
        let (button_tx, button_rx) = mpsc::channel(capacity);
        let (presence_tx, presence_rx) = mpsc::channel(capacity);
        let (light_tx, light_rx) = mpsc::channel(capacity);
        (
            EventQueues {
                button: button_tx,
                presence: presence_tx,
                light: light_tx,
            },
            EventReceivers {
                button: button_rx,
                presence: presence_rx,
                light: light_rx,
            },
        )
    }

    /// Route an event to its category queue without blocking the poller. A
    /// full queue drops the event (delivery is at-most-once, best-effort).
    pub fn push(&self, event: TriggerEvent) {
        let queue = match event.category() {
            EventCategory::Button => &self.button,
            EventCategory::Presence => &self.presence,
            EventCategory::Light => &self.light,
        };
        if let Err(err) = queue.try_send(event) {
            warn!("event queue full; dropping event: {err}");
        }
    }
}
