//! Async seams between the link manager and a Bluetooth stack.
//!
//! [`crate::link::DeviceLink`] only ever talks to these traits.  The real
//! backend lives in [`crate::btle`] (feature `btle`); [`crate::mock`] provides
//! a scriptable in-memory stack for tests.
//!
//! | Trait | Owns |
//! |---|---|
//! | [`Platform`] | permission prompts, creating the radio resource |
//! | [`Radio`] | adapter power state, scanning, its own teardown |
//! | [`Peripheral`] | one remote device: connect, GATT topology, subscribe, write |

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::LinkError;

/// Power state of the local Bluetooth radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
    Unknown,
}

/// One advertisement seen during a scan.
#[derive(Debug, Clone)]
pub struct Advertisement<P> {
    /// Advertised local name, if the packet carried one.
    pub name: Option<String>,
    pub peripheral: P,
}

/// A GATT service and the characteristic UUIDs beneath it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Advertisements in the order the radio reports them.
pub type AdvertisementStream<P> = BoxStream<'static, Result<Advertisement<P>, LinkError>>;

/// Raw notification values from one characteristic, in platform order.
///
/// An `Err` item is a subscription error; the end of the stream means the
/// peripheral dropped the link.
pub type NotificationStream = BoxStream<'static, Result<Vec<u8>, LinkError>>;

/// Host-side entry point: permissions plus a factory for the radio resource.
///
/// `open_radio` may be called more than once over the life of a link manager:
/// after a platform-cancellation error the old radio is shut down and a fresh
/// one is opened.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    type Radio: Radio;

    /// Ask for (or confirm) permission to scan and connect.
    async fn request_permissions(&self) -> bool;

    /// Create the radio-manager resource.
    async fn open_radio(&self) -> Result<Self::Radio, LinkError>;
}

#[async_trait]
pub trait Radio: Send + Sync + 'static {
    type Peripheral: Peripheral;

    async fn state(&self) -> Result<RadioState, LinkError>;

    /// Start an unfiltered scan and return the advertisement stream.
    async fn start_scan(&self) -> Result<AdvertisementStream<Self::Peripheral>, LinkError>;

    async fn stop_scan(&self) -> Result<(), LinkError>;

    /// Release the radio.  Must tolerate being called on a radio that never
    /// scanned or connected.
    async fn shutdown(&self);
}

#[async_trait]
pub trait Peripheral: Clone + Send + Sync + 'static {
    /// Platform identifier (MAC address on Linux, UUID on macOS).
    fn id(&self) -> String;

    async fn connect(&self) -> Result<(), LinkError>;

    /// Enumerate services and their characteristics.
    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, LinkError>;

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, LinkError>;

    async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<(), LinkError>;

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8])
        -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;
}
