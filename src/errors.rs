/// All error types that can occur while bridging the hub to downstream devices.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration file could not be read or parsed. Startup-fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to serialize data to JSON.
    #[error("failed to dump json: {0:?}")]
    JsonDump(serde_json::Error),

    /// A network socket operation failed.
    #[error("socket {action} error: {err:?}")]
    Socket { action: String, err: std::io::Error },

    /// An HTTP request to the hub or a downstream device failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// An entity in the hub's full-state response was missing a required field.
    #[error("hub entity {entity:?} is missing field {field:?}")]
    EntityDecode { entity: String, field: &'static str },

    /// A message targeted a device that has never been discovered or connected.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The per-device send queue is full; the message was dropped.
    #[error("send queue full for device {0}")]
    QueueFull(String),

    /// A downstream HTTP device returned a non-success status.
    #[error("device {device} answered with status {status}")]
    DeviceStatus { device: String, status: u16 },
}

impl Error {
    /// Create a new socket error
    pub fn socket(action: &str, err: std::io::Error) -> Self {
        Error::Socket {
            action: action.to_string(),
            err,
        }
    }

    /// Create a new per-entity decode error
    pub fn entity_decode(entity: &str, field: &'static str) -> Self {
        Error::EntityDecode {
            entity: entity.to_string(),
            field,
        }
    }
}

/// Hacky implementation of PartialEq for testing
#[cfg(test)]
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}
