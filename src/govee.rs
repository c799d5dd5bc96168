//! Govee LAN control: multicast discovery plus per-device UDP send workers.
//!
//! Devices announce themselves in response to a `scan` request broadcast to
//! the LAN-control multicast group. Announced devices the action table cares
//! about get a connected UDP socket and a bounded mailbox drained by a
//! dedicated worker, so a slow device never blocks the others.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::{Configuration, SendFailurePolicy};
use crate::errors::Error;
use crate::resolver::ProtocolCommand;

type Result<T> = std::result::Result<T, Error>;

pub const MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const BROADCAST_PORT: u16 = 4001;
pub const LISTEN_PORT: u16 = 4002;
pub const SEND_PORT: u16 = 4003;

const SCAN_INTERVAL: Duration = Duration::from_secs(10);
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAILBOX_CAPACITY: usize = 20;

// ---------------------------------------------------------------------------
// Wire models. Every request and response travels inside a `{"msg": {...}}`
// envelope with a `cmd` discriminator.
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Envelope<T> {
    msg: EnvelopeMsg<T>,
}

#[derive(Debug, Serialize)]
struct EnvelopeMsg<T> {
    cmd: &'static str,
    data: T,
}

fn envelope<T: Serialize>(cmd: &'static str, data: T) -> Result<Vec<u8>> {
    serde_json::to_vec(&Envelope {
        msg: EnvelopeMsg { cmd, data },
    })
    .map_err(Error::JsonDump)
}

#[derive(Debug, Serialize)]
struct ScanData {
    account_topic: &'static str,
}

#[derive(Debug, Serialize)]
struct ValueData {
    value: i64,
}

#[derive(Debug, Serialize)]
struct ColorData {
    color: Rgb,
    #[serde(rename = "colorTemInKelvin")]
    kelvin: i64,
}

#[derive(Debug, Serialize)]
struct Rgb {
    r: i64,
    g: i64,
    b: i64,
}

#[derive(Debug, Serialize)]
struct EmptyData {}

pub fn scan_request() -> Result<Vec<u8>> {
    envelope(
        "scan",
        ScanData {
            account_topic: "reserve",
        },
    )
}

pub fn status_request() -> Result<Vec<u8>> {
    envelope("devStatus", EmptyData {})
}

/// Encode a resolved command into its LAN-control datagram.
pub fn encode_command(command: &ProtocolCommand) -> Result<Vec<u8>> {
    match *command {
        ProtocolCommand::TurnOn => envelope("turn", ValueData { value: 1 }),
        ProtocolCommand::TurnOff => envelope("turn", ValueData { value: 0 }),
        ProtocolCommand::SetBrightness(value) => envelope("brightness", ValueData { value }),
        ProtocolCommand::SetColor { r, g, b } => envelope(
            "colorwc",
            ColorData {
                color: Rgb {
                    r: i64::from(r),
                    g: i64::from(g),
                    b: i64::from(b),
                },
                kelvin: 0,
            },
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    msg: ResponseMsg,
}

#[derive(Debug, Deserialize)]
struct ResponseMsg {
    cmd: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ScanAnnouncement {
    ip: String,
    device: String,
    sku: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceStatusData {
    #[serde(rename = "onOff", default)]
    on_off: f64,
    #[serde(default)]
    brightness: f64,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum DeviceSlot {
    /// Referenced by the action table, not yet announced.
    Awaiting,
    /// Announced; the dial attempt is running or has failed.
    Discovered { ip: String, sku: String },
    /// Connected with a live send worker.
    Connected {
        ip: String,
        sku: String,
        mailbox: mpsc::Sender<Vec<u8>>,
    },
}

/// Connection registry for every Govee device the action table references.
///
/// `send` is non-blocking: a full mailbox or an unknown device is an error
/// reported to the caller, never a stall of the dispatch workers.
pub struct GoveeRegistry {
    configuration: Arc<Configuration>,
    devices: Mutex<HashMap<String, DeviceSlot>>,
}

impl GoveeRegistry {
    pub fn new(configuration: Arc<Configuration>) -> Arc<Self> {
        let mut devices = HashMap::new();
        for device in configuration.required_govee_devices() {
            devices.insert(device, DeviceSlot::Awaiting);
        }
        Arc::new(GoveeRegistry {
            configuration,
            devices: Mutex::new(devices),
        })
    }

    /// Enqueue a datagram for a device. Fails when the device was never
    /// announced, is not yet connected, or its mailbox is full.
    pub async fn send(&self, device: &str, payload: Vec<u8>) -> Result<()> {
        let devices = self.devices.lock().await;
        match devices.get(device) {
            Some(DeviceSlot::Connected { mailbox, .. }) => mailbox
                .try_send(payload)
                .map_err(|_| Error::QueueFull(device.to_string())),
            Some(_) | None => Err(Error::DeviceNotFound(device.to_string())),
        }
    }

    /// Send a resolved command to a device.
    pub async fn send_command(&self, device: &str, command: &ProtocolCommand) -> Result<()> {
        self.send(device, encode_command(command)?).await
    }

    /// Run discovery: join the multicast group, rebroadcast the scan request
    /// periodically and decode announcements on the listen port.
    ///
    /// Only the startup steps can fail. Once the sockets are up, transient
    /// I/O errors inside the loops are logged and retried so a momentary
    /// network outage never ends discovery for the life of the process.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let broadcast = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::socket("bind", e))?;
        let request = scan_request()?;

        let listener = UdpSocket::bind(("0.0.0.0", LISTEN_PORT))
            .await
            .map_err(|e| Error::socket("bind", e))?;
        listener
            .join_multicast_v4(MULTICAST_ADDRESS, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| Error::socket("join_multicast_v4", e))?;

        tokio::join!(
            Self::broadcast_loop(broadcast, request, cancel.clone()),
            self.receive_loop(listener, cancel)
        );
        Ok(())
    }

    async fn broadcast_loop(socket: UdpSocket, request: Vec<u8>, cancel: CancellationToken) {
        loop {
            match socket
                .send_to(&request, (MULTICAST_ADDRESS, BROADCAST_PORT))
                .await
            {
                Ok(_) => debug!("Sent scan request to the multicast group"),
                Err(err) => warn!("Error broadcasting scan request: {err}"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = time::sleep(SCAN_INTERVAL) => {}
            }
        }
    }

    async fn receive_loop(
        self: &Arc<Self>,
        listener: UdpSocket,
        cancel: CancellationToken,
    ) {
        let mut buffer = [0u8; 1024];
        loop {
            let (size, addr) = tokio::select! {
                _ = cancel.cancelled() => return,
                received = listener.recv_from(&mut buffer) => match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("Error receiving discovery datagram: {err}");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = time::sleep(RECEIVE_RETRY_DELAY) => {}
                        }
                        continue;
                    }
                }
            };
            match serde_json::from_slice::<ResponseEnvelope>(&buffer[..size]) {
                Ok(response) => self.handle_response(response, cancel.clone()).await,
                Err(err) => {
                    warn!("Undecodable datagram from {addr}: {err}");
                }
            }
        }
    }

    async fn handle_response(
        self: &Arc<Self>,
        response: ResponseEnvelope,
        cancel: CancellationToken,
    ) {
        match response.msg.cmd.as_str() {
            "scan" => {
                let announcement: ScanAnnouncement =
                    match serde_json::from_value(response.msg.data) {
                        Ok(announcement) => announcement,
                        Err(err) => {
                            warn!("Undecodable scan announcement: {err}");
                            return;
                        }
                    };
                self.handle_announcement(announcement, cancel).await;
            }
            "devStatus" => {
                let status: DeviceStatusData = match serde_json::from_value(response.msg.data) {
                    Ok(status) => status,
                    Err(err) => {
                        warn!("Undecodable devStatus response: {err}");
                        return;
                    }
                };
                // Responses do not carry the device id, so the report cannot
                // be attributed to a device; it is logged and dropped.
                debug!(
                    "Device status report [on: {}, brightness: {}]",
                    status.on_off == 1.0,
                    status.brightness
                );
            }
            other => {
                debug!("Ignoring response of type [{other}]");
            }
        }
    }

    async fn handle_announcement(
        self: &Arc<Self>,
        announcement: ScanAnnouncement,
        cancel: CancellationToken,
    ) {
        let alias = self.configuration.govee_alias_for(&announcement.device);

        // The lock guards the whole decision so the same device is never
        // dialed twice concurrently.
        let mut devices = self.devices.lock().await;
        let dial = match devices.get(&alias) {
            None => {
                debug!(
                    "Ignoring announcement from unreferenced device [{} - {} - {}]",
                    announcement.sku, announcement.ip, announcement.device
                );
                false
            }
            Some(DeviceSlot::Awaiting) => {
                info!(
                    "Found Govee device [{} - {} - {}]",
                    announcement.sku, announcement.ip, announcement.device
                );
                true
            }
            // A dial attempt is in flight or failed; a changed address
            // migrates the registration so the next attempt uses it.
            Some(DeviceSlot::Discovered { ip, sku }) => {
                let changed = *ip != announcement.ip || *sku != announcement.sku;
                if changed {
                    info!(
                        "Device [{alias}] re-announced as [{} - {}]; migrating",
                        announcement.sku, announcement.ip
                    );
                }
                changed
            }
            Some(DeviceSlot::Connected { ip, .. }) => {
                if *ip != announcement.ip {
                    info!(
                        "Connected device [{alias}] re-announced from [{}]; keeping the existing connection",
                        announcement.ip
                    );
                }
                false
            }
        };

        if dial {
            devices.insert(
                alias.clone(),
                DeviceSlot::Discovered {
                    ip: announcement.ip.clone(),
                    sku: announcement.sku.clone(),
                },
            );
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                registry.connect(alias, announcement, cancel).await;
            });
        }
    }

    /// Dial the device and install its mailbox and send worker.
    async fn connect(
        self: Arc<Self>,
        alias: String,
        announcement: ScanAnnouncement,
        cancel: CancellationToken,
    ) {
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(err) => {
                error!("Error binding socket for device [{alias}]: {err}");
                return;
            }
        };
        if let Err(err) = socket
            .connect((announcement.ip.as_str(), SEND_PORT))
            .await
        {
            error!(
                "Error connecting to Govee device [{} - {} - {}]: {err}",
                announcement.sku, announcement.ip, announcement.device
            );
            return;
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        {
            let mut devices = self.devices.lock().await;
            // The slot may have migrated to a newer address while this dial
            // was in flight; only install over the address we dialed.
            let current = matches!(
                devices.get(&alias),
                Some(DeviceSlot::Discovered { ip, .. }) if *ip == announcement.ip
            );
            if !current {
                return;
            }
            devices.insert(
                alias.clone(),
                DeviceSlot::Connected {
                    ip: announcement.ip.clone(),
                    sku: announcement.sku.clone(),
                    mailbox: tx,
                },
            );
        }

        info!("Connected to Govee device [{alias}] at {}:{SEND_PORT}", announcement.ip);

        // Ask for an initial status report; the reply lands in the debug log.
        if let Ok(request) = status_request() {
            if let Err(err) = self.send(&alias, request).await {
                warn!("cannot request initial status from [{alias}]: {err}");
            }
        }

        let registry = Arc::clone(&self);
        tokio::spawn(async move {
            registry
                .send_worker(alias, announcement, socket, rx, cancel)
                .await;
        });
    }

    /// Drain one device's mailbox in order. Write failures follow the
    /// configured policy.
    async fn send_worker(
        self: Arc<Self>,
        alias: String,
        announcement: ScanAnnouncement,
        socket: UdpSocket,
        mut rx: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => return,
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => return,
                },
            };

            debug!(
                "Forwarding message to Govee device [{} - {} - {}]: {}",
                announcement.sku,
                announcement.ip,
                announcement.device,
                String::from_utf8_lossy(&payload)
            );
            if let Err(err) = socket.send(&payload).await {
                error!(
                    "Error forwarding message to Govee device [{} - {} - {}]: {err}",
                    announcement.sku, announcement.ip, announcement.device
                );
                if self.configuration.govee_send_failure == SendFailurePolicy::Reconnect {
                    warn!("Dropping connection to [{alias}]; next announcement redials");
                    let mut devices = self.devices.lock().await;
                    devices.insert(
                        alias.clone(),
                        DeviceSlot::Discovered {
                            ip: announcement.ip.clone(),
                            sku: announcement.sku.clone(),
                        },
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration() -> Arc<Configuration> {
        Arc::new(
            Configuration::parse(
                r#"{
                    "actions": [
                        {
                            "trigger": "hue tap dial button press",
                            "dial_name": "Desk",
                            "hue_tap_dial_buttons": [1002],
                            "govee_actions": [{"device": "Lamp", "action": "turn on"}]
                        }
                    ],
                    "govee": {"Lamp": {"mac": "AA:BB:CC"}}
                }"#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_turn_payloads() {
        let on = encode_command(&ProtocolCommand::TurnOn).unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&on).unwrap(),
            serde_json::json!({"msg": {"cmd": "turn", "data": {"value": 1}}})
        );
        let off = encode_command(&ProtocolCommand::TurnOff).unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&off).unwrap(),
            serde_json::json!({"msg": {"cmd": "turn", "data": {"value": 0}}})
        );
    }

    #[test]
    fn test_color_payload_carries_kelvin_field() {
        let payload =
            encode_command(&ProtocolCommand::SetColor { r: 1, g: 2, b: 3 }).unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&payload).unwrap(),
            serde_json::json!({
                "msg": {
                    "cmd": "colorwc",
                    "data": {"color": {"r": 1, "g": 2, "b": 3}, "colorTemInKelvin": 0}
                }
            })
        );
    }

    #[test]
    fn test_scan_request_shape() {
        let payload = scan_request().unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&payload).unwrap(),
            serde_json::json!({
                "msg": {"cmd": "scan", "data": {"account_topic": "reserve"}}
            })
        );
    }

    #[tokio::test]
    async fn test_send_before_discovery_fails() {
        let registry = GoveeRegistry::new(configuration());
        let err = registry
            .send_command("Lamp", &ProtocolCommand::TurnOn)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_send_to_unreferenced_device_fails() {
        let registry = GoveeRegistry::new(configuration());
        let err = registry
            .send_command("Unknown", &ProtocolCommand::TurnOn)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }

    #[tokio::test]
    async fn test_announcement_for_alias_is_resolved_by_mac() {
        let registry = GoveeRegistry::new(configuration());
        let cancel = CancellationToken::new();
        cancel.cancel();
        registry
            .handle_announcement(
                ScanAnnouncement {
                    ip: "127.0.0.1".to_string(),
                    device: "AA:BB:CC".to_string(),
                    sku: "H6159".to_string(),
                },
                cancel,
            )
            .await;
        let devices = registry.devices.lock().await;
        assert!(matches!(
            devices.get("Lamp"),
            Some(DeviceSlot::Discovered { .. }) | Some(DeviceSlot::Connected { .. })
        ));
    }

    #[tokio::test]
    async fn test_receive_loop_survives_undecodable_datagrams() {
        let registry = GoveeRegistry::new(configuration());
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let receiver = {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            tokio::spawn(async move { registry.receive_loop(listener, cancel).await })
        };

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"not a json envelope", addr).await.unwrap();
        let announcement = serde_json::json!({
            "msg": {
                "cmd": "scan",
                "data": {"ip": "127.0.0.1", "device": "AA:BB:CC", "sku": "H6159"}
            }
        });
        sender
            .send_to(announcement.to_string().as_bytes(), addr)
            .await
            .unwrap();

        let deadline = time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let devices = registry.devices.lock().await;
                if !matches!(devices.get("Lamp"), Some(DeviceSlot::Awaiting)) {
                    break;
                }
            }
            assert!(
                time::Instant::now() < deadline,
                "announcement after the bad datagram was never processed"
            );
            time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        receiver.await.unwrap();
    }

    #[tokio::test]
    async fn test_status_report_without_device_id_is_absorbed() {
        let registry = GoveeRegistry::new(configuration());
        let cancel = CancellationToken::new();
        let response: ResponseEnvelope = serde_json::from_value(serde_json::json!({
            "msg": {"cmd": "devStatus", "data": {"onOff": 1, "brightness": 80}}
        }))
        .unwrap();
        registry.handle_response(response, cancel).await;
        let devices = registry.devices.lock().await;
        assert!(matches!(devices.get("Lamp"), Some(DeviceSlot::Awaiting)));
    }
}
