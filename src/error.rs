use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::platform::RadioState;
use crate::session::Endpoint;

/// Errors raised while discovering, establishing, or running a device link.
///
/// Everything except [`LinkError::Cancelled`] is terminal for the operation in
/// progress; see [`LinkError::is_transient`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Bluetooth permission not granted")]
    PermissionDenied,

    #[error("Bluetooth radio unavailable (state: {0:?})")]
    RadioUnavailable(RadioState),

    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("no device advertising as \"{name}\" within {} s", .after.as_secs())]
    DiscoveryTimeout { name: String, after: Duration },

    #[error("service {0} not found on device")]
    ServiceNotFound(Uuid),

    #[error("{endpoint} characteristic {uuid} not found under service {service}")]
    CharacteristicNotFound {
        endpoint: Endpoint,
        service: Uuid,
        uuid: Uuid,
    },

    #[error("{operation} timed out after {} s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("platform cancelled the operation: {0}")]
    Cancelled(String),

    #[error("invalid identifier {text:?}: {reason}")]
    InvalidIdentifier { text: String, reason: String },

    #[error("a connection attempt is already in progress")]
    Busy,

    #[error("device is not connected")]
    NotConnected,

    #[error("peripheral dropped the link")]
    LinkLost,

    #[error("link manager has been destroyed")]
    Destroyed,

    #[error("connection attempt superseded")]
    Superseded,

    #[error("Bluetooth platform error: {0}")]
    Platform(String),
}

impl LinkError {
    /// `true` for the "operation was cancelled by the platform" class.
    ///
    /// These mean the platform radio session itself is unusable; the link
    /// manager recovers by recreating the radio resource and scheduling one
    /// reconnect instead of reporting a terminal failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::Cancelled(_))
    }

    /// Classify a free-form platform error message.
    ///
    /// Platform stacks report cancellation only through message text
    /// ("Operation was cancelled", "operation canceled", …).
    pub fn from_platform_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("cancelled") || lower.contains("canceled") {
            LinkError::Cancelled(message)
        } else {
            LinkError::Platform(message)
        }
    }
}

/// Reasons a notification payload could not be turned into a sample.
///
/// Decode errors never leave the decode pipeline: the link manager logs them
/// at `debug` and drops the payload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    Base64(String),

    #[error("unrecognised payload: {0:?}")]
    Unrecognized(String),
}
