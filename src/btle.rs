//! [`Platform`] implementation over `btleplug` (BlueZ, CoreBluetooth, WinRT).
//!
//! Enabled with the `btle` feature.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager};
use futures::future::ready;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::LinkError;
use crate::platform::{
    Advertisement, AdvertisementStream, NotificationStream, Peripheral, Platform, Radio,
    RadioState, ServiceInfo,
};

impl From<btleplug::Error> for LinkError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::PermissionDenied => LinkError::PermissionDenied,
            btleplug::Error::TimedOut(after) => LinkError::Timeout {
                operation: "Bluetooth operation",
                after,
            },
            btleplug::Error::NotConnected => LinkError::NotConnected,
            other => LinkError::from_platform_message(other.to_string()),
        }
    }
}

/// The host's Bluetooth stack.
///
/// `btleplug` has no permission prompt of its own: a denied authorization on
/// macOS surfaces as [`RadioState::Unknown`] or as a `PermissionDenied` error
/// from the first scan, both of which the link manager reports.
#[derive(Debug, Clone, Default)]
pub struct BtlePlatform;

#[async_trait]
impl Platform for BtlePlatform {
    type Radio = BtleRadio;

    async fn request_permissions(&self) -> bool {
        true
    }

    async fn open_radio(&self) -> Result<BtleRadio, LinkError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(LinkError::NoAdapter)?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using adapter {info}"),
            Err(e) => debug!("adapter_info() failed: {e}"),
        }
        Ok(BtleRadio {
            _manager: manager,
            adapter,
        })
    }
}

/// One `btleplug` manager plus the first adapter it reports.
pub struct BtleRadio {
    // Held so the platform session outlives every adapter handle.
    _manager: Manager,
    adapter: Adapter,
}

impl std::fmt::Debug for BtleRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleRadio").finish_non_exhaustive()
    }
}

fn radio_state(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

#[async_trait]
impl Radio for BtleRadio {
    type Peripheral = BtlePeripheral;

    async fn state(&self) -> Result<RadioState, LinkError> {
        // CoreBluetooth starts in "unknown" right after launch or a Bluetooth
        // toggle, and scanning before it reaches poweredOn is a silent no-op.
        #[cfg(target_os = "macos")]
        {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match self.adapter.adapter_state().await? {
                    CentralState::PoweredOn => {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        return Ok(RadioState::PoweredOn);
                    }
                    state if tokio::time::Instant::now() >= deadline => {
                        warn!("macOS: adapter still {state:?} after 3 s");
                        return Ok(radio_state(state));
                    }
                    state => debug!("macOS: adapter state = {state:?}, waiting…"),
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        #[cfg(not(target_os = "macos"))]
        {
            Ok(radio_state(self.adapter.adapter_state().await?))
        }
    }

    async fn start_scan(&self) -> Result<AdvertisementStream<BtlePeripheral>, LinkError> {
        // Subscribe before scanning so no discovery event is missed.
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        // Peripherals the stack already knows about (BlueZ caches them across
        // scans) may never produce a fresh DeviceDiscovered.
        let known = self.adapter.peripherals().await.unwrap_or_default();
        let adapter = self.adapter.clone();
        let known = stream::iter(known).then(move |p| {
            let adapter = adapter.clone();
            async move { advertisement(adapter, p).await }
        });

        let adapter = self.adapter.clone();
        let discovered = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        match adapter.peripheral(&id).await {
                            Ok(p) => Some(advertisement(adapter, p).await),
                            Err(e) => {
                                debug!("peripheral {id:?} vanished: {e}");
                                None
                            }
                        }
                    }
                    _ => None,
                }
            }
        });

        Ok(known.chain(discovered).boxed())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn shutdown(&self) {
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("stop_scan during shutdown: {e}");
        }
        info!("Bluetooth radio released");
    }
}

async fn advertisement(
    adapter: Adapter,
    peripheral: btleplug::platform::Peripheral,
) -> Result<Advertisement<BtlePeripheral>, LinkError> {
    let name = peripheral
        .properties()
        .await
        .ok()
        .flatten()
        .and_then(|props| props.local_name);
    Ok(Advertisement {
        name,
        peripheral: BtlePeripheral {
            peripheral,
            adapter,
        },
    })
}

/// A remote device seen by a [`BtleRadio`].
///
/// Keeps the adapter that discovered it so disconnects can be watched on the
/// adapter's event stream without opening a second manager.
#[derive(Clone)]
pub struct BtlePeripheral {
    peripheral: btleplug::platform::Peripheral,
    adapter: Adapter,
}

impl std::fmt::Debug for BtlePeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtlePeripheral")
            .field("id", &self.peripheral.id())
            .finish_non_exhaustive()
    }
}

impl BtlePeripheral {
    fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic, LinkError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == uuid)
            .ok_or_else(|| {
                LinkError::Platform(format!("characteristic {uuid} not resolved under {service}"))
            })
    }
}

#[async_trait]
impl Peripheral for BtlePeripheral {
    fn id(&self) -> String {
        self.peripheral.id().to_string()
    }

    async fn connect(&self) -> Result<(), LinkError> {
        self.peripheral.connect().await?;
        // BlueZ reports the connection before its GATT cache is populated;
        // discovering services straight away can return an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, LinkError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|s| ServiceInfo {
                uuid: s.uuid,
                characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream, LinkError> {
        let target = self.characteristic(service, characteristic)?;
        // Open both streams before subscribing so the first value and an early
        // disconnect are not lost.
        let notifications = self.peripheral.notifications().await?;
        let mut adapter_events = self.adapter.events().await?;
        self.peripheral.subscribe(&target).await?;

        let id = self.peripheral.id();
        let disconnected = async move {
            while let Some(event) = adapter_events.next().await {
                if matches!(&event, CentralEvent::DeviceDisconnected(d) if *d == id) {
                    info!("Disconnect watcher: device {id:?} disconnected.");
                    break;
                }
            }
        };

        Ok(notifications
            .filter(move |n| ready(n.uuid == characteristic))
            .map(|n| Ok(n.value))
            .take_until(disconnected)
            .boxed())
    }

    async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<(), LinkError> {
        let target = self.characteristic(service, characteristic)?;
        self.peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<(), LinkError> {
        let target = self.characteristic(service, characteristic)?;
        self.peripheral
            .write(&target, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
