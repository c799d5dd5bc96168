//! HTTP-based device protocols: Switchbot, WLED and Twinkly.
//!
//! Each sender resolves a configured device alias to its coordinates and
//! performs one request per command. They share no connection state beyond
//! the reqwest client's pool.

pub mod switchbot;
pub mod twinkly;
pub mod wled;

pub use switchbot::SwitchbotSender;
pub use twinkly::TwinklySender;
pub use wled::WledSender;
