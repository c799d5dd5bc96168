//! Event dispatch workers.
//!
//! One worker per trigger category drains its queue, resolves each event
//! against the action table and forwards the resulting batch. Delivery
//! errors are logged per command; a failing device never stops the batch.

use std::sync::Arc;

use log::error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventReceivers, TriggerEvent};
use crate::govee::GoveeRegistry;
use crate::resolver::{ActionResolver, OutboundBatch};
use crate::senders::{SwitchbotSender, TwinklySender, WledSender};

pub struct Dispatcher {
    resolver: ActionResolver,
    govee: Arc<GoveeRegistry>,
    twinkly: Arc<TwinklySender>,
    switchbot: Arc<SwitchbotSender>,
    wled: Arc<WledSender>,
}

impl Dispatcher {
    pub fn new(
        resolver: ActionResolver,
        govee: Arc<GoveeRegistry>,
        twinkly: Arc<TwinklySender>,
        switchbot: Arc<SwitchbotSender>,
        wled: Arc<WledSender>,
    ) -> Arc<Self> {
        Arc::new(Dispatcher {
            resolver,
            govee,
            twinkly,
            switchbot,
            wled,
        })
    }

    /// Spawn the three category workers.
    pub fn start(
        self: &Arc<Self>,
        receivers: EventReceivers,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let EventReceivers {
            button,
            presence,
            light,
        } = receivers;
        vec![
            tokio::spawn(Arc::clone(self).worker(button, cancel.clone())),
            tokio::spawn(Arc::clone(self).worker(presence, cancel.clone())),
            tokio::spawn(Arc::clone(self).worker(light, cancel.clone())),
        ]
    }

    async fn worker(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<TriggerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = receiver.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            let batch = self.resolve(event).await;
            self.deliver(batch).await;
        }
    }

    async fn resolve(&self, event: TriggerEvent) -> OutboundBatch {
        match event {
            TriggerEvent::ButtonPressed { dial, code } => {
                self.resolver
                    .on_button_pressed(&dial, code, self.wled.as_ref())
                    .await
            }
            TriggerEvent::PresenceChanged { sensor, present } => {
                self.resolver.on_presence_changed(&sensor, present)
            }
            TriggerEvent::LightPower { light, on } => self.resolver.on_light_power(&light, on),
            TriggerEvent::LightBrightness { light, percent } => {
                self.resolver.on_light_brightness(&light, percent)
            }
            TriggerEvent::LightColor { light, r, g, b } => {
                self.resolver.on_light_color(&light, r, g, b)
            }
        }
    }

    async fn deliver(&self, batch: OutboundBatch) {
        for outbound in &batch.govee {
            if let Err(err) = self.govee.send_command(&outbound.device, &outbound.command).await {
                error!("error sending Govee message to [{}]: {err}", outbound.device);
            }
        }
        for outbound in &batch.twinkly {
            if let Err(err) = self.twinkly.send(&outbound.command).await {
                error!("error sending Twinkly message: {err}");
            }
        }
        for outbound in &batch.switchbot {
            if let Err(err) = self.switchbot.send(&outbound.device, &outbound.command).await {
                error!(
                    "error sending Switchbot message to [{}]: {err}",
                    outbound.device
                );
            }
        }
        for outbound in &batch.wled {
            if let Err(err) = self.wled.send(&outbound.device, &outbound.command).await {
                error!("error sending WLED message to [{}]: {err}", outbound.device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brightness::BrightnessCache;
    use crate::config::Configuration;
    use crate::status::StatusStore;

    fn dispatcher(raw: &str) -> Arc<Dispatcher> {
        let configuration = Arc::new(Configuration::parse(raw).unwrap());
        let resolver = ActionResolver::new(
            Arc::clone(&configuration),
            Arc::new(StatusStore::new()),
            Arc::new(BrightnessCache::new()),
        );
        Dispatcher::new(
            resolver,
            GoveeRegistry::new(Arc::clone(&configuration)),
            TwinklySender::new(&configuration),
            Arc::new(SwitchbotSender::new(&configuration)),
            Arc::new(WledSender::new(&configuration).unwrap()),
        )
    }

    #[tokio::test]
    async fn test_undeliverable_batch_is_absorbed() {
        // The Govee device is referenced but never discovered; delivery must
        // log and carry on rather than propagate.
        let dispatcher = dispatcher(
            r#"{
                "actions": [
                    {
                        "trigger": "hue tap dial button press",
                        "dial_name": "Desk",
                        "hue_tap_dial_buttons": [1002],
                        "govee_actions": [{"device": "Lamp", "action": "turn on"}]
                    }
                ]
            }"#,
        );
        let batch = dispatcher
            .resolve(TriggerEvent::ButtonPressed {
                dial: "Desk".into(),
                code: 1002,
            })
            .await;
        assert!(!batch.govee.is_empty());
        dispatcher.deliver(batch).await;
    }

    #[tokio::test]
    async fn test_worker_stops_when_queue_closes() {
        let dispatcher = dispatcher("{}");
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&dispatcher).worker(rx, cancel));
        drop(tx);
        handle.await.unwrap();
    }
}
