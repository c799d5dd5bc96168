//! # huesync
//!
//! A bridge that mirrors Philips Hue activity onto other smart-home
//! ecosystems: Govee lights over the LAN-control UDP protocol, WLED and
//! Twinkly controllers over their local HTTP APIs, and Switchbot devices
//! through the cloud API.
//!
//! The pipeline has three stages:
//!
//! 1. The hub poller fetches the bridge's full state every 200 ms and turns
//!    observed changes (dial presses, presence transitions, light state)
//!    into [`events::TriggerEvent`]s.
//! 2. The [`resolver::ActionResolver`] matches each event against the
//!    configured action table and produces per-protocol command batches.
//! 3. Dispatch workers forward the batches to the protocol senders; the
//!    [`govee::GoveeRegistry`] additionally discovers its devices via
//!    multicast before it can deliver anything.
//!
//! A small HTTP endpoint (`GET /api/v1/`) reports the last-known status of
//! every downstream device.

pub mod brightness;
pub mod color;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod govee;
pub mod hub;
pub mod mapping;
pub mod resolver;
pub mod senders;
pub mod server;
pub mod status;

pub use config::Configuration;
pub use errors::Error;
