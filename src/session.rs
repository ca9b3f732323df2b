//! Session establishment: connect, resolve the GATT topology, subscribe.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::LinkError;
use crate::platform::{NotificationStream, Peripheral, ServiceInfo};
use crate::types::ConnectionState;

/// Role of a characteristic within the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// The device pushes readings into it.
    Notify,
    /// Reserved for host-to-device commands.
    Write,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Endpoint::Notify => "notify",
            Endpoint::Write => "write",
        })
    }
}

/// The identifiers a session must resolve on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub service: Uuid,
    pub notify: Uuid,
    pub write: Uuid,
}

impl Endpoints {
    /// Check the enumerated topology against these identifiers.
    ///
    /// The service is checked first so a missing service is reported as such
    /// rather than as two missing characteristics.
    pub fn resolve(&self, services: &[ServiceInfo]) -> Result<(), LinkError> {
        let Some(service) = services.iter().find(|s| s.uuid == self.service) else {
            let found: Vec<String> = services.iter().map(|s| s.uuid.to_string()).collect();
            warn!("service {} not found; device exposes [{}]", self.service, found.join(", "));
            return Err(LinkError::ServiceNotFound(self.service));
        };
        for (endpoint, uuid) in [(Endpoint::Notify, self.notify), (Endpoint::Write, self.write)] {
            if !service.characteristics.contains(&uuid) {
                return Err(LinkError::CharacteristicNotFound {
                    endpoint,
                    service: self.service,
                    uuid,
                });
            }
        }
        Ok(())
    }
}

/// A connected peripheral together with its resolved endpoints.
///
/// Owned exclusively by one link manager; created when establishment succeeds
/// and released on disconnect or teardown.
#[derive(Debug, Clone)]
pub struct PeripheralHandle<P> {
    pub peripheral: P,
    pub endpoints: Endpoints,
}

impl<P: Peripheral> PeripheralHandle<P> {
    /// Drop the notification subscription and the physical connection.
    ///
    /// Errors are logged, not returned: by the time a handle is released the
    /// link is going away regardless.
    pub async fn release(&self) {
        let Endpoints { service, notify, .. } = self.endpoints;
        if let Err(e) = self.peripheral.unsubscribe(service, notify).await {
            debug!("unsubscribe failed during release: {e}");
        }
        match self.peripheral.disconnect().await {
            Ok(()) => info!("Disconnected from {}", self.peripheral.id()),
            Err(e) => warn!("disconnect failed during release: {e}"),
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        self.peripheral
            .write(self.endpoints.service, self.endpoints.write, data)
            .await
    }
}

/// A fully established session: the subscription is live.
pub struct Session<P> {
    pub handle: PeripheralHandle<P>,
    pub notifications: NotificationStream,
}

impl<P: fmt::Debug> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Time limits for the individual establishment steps.
#[derive(Debug, Clone, Copy)]
pub struct StepTimeouts {
    pub connect: Duration,
    pub discover: Duration,
}

async fn bounded<T>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T, LinkError>>,
) -> Result<T, LinkError> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| LinkError::Timeout { operation, after })?
}

/// Connect to `peripheral` and open the notification subscription.
///
/// Steps, each aborting the whole establishment on failure:
/// 1. physical connect
/// 2. enumerate services and characteristics
/// 3. verify the service is present
/// 4. resolve the notify and write characteristics
/// 5. subscribe to the notify characteristic
///
/// `on_step` is told which [`ConnectionState`] each step runs under.  On any
/// failure after step 1 started, the peripheral is disconnected before the
/// error is returned, so a failed establishment never leaks a connection.
pub async fn establish<P: Peripheral>(
    peripheral: P,
    endpoints: Endpoints,
    timeouts: StepTimeouts,
    mut on_step: impl FnMut(ConnectionState) + Send,
) -> Result<Session<P>, LinkError> {
    let id = peripheral.id();

    on_step(ConnectionState::Connecting);
    info!("Connecting to {id} …");
    let result = async {
        bounded("connect", timeouts.connect, peripheral.connect()).await?;
        info!("Connected to {id}");

        on_step(ConnectionState::DiscoveringTopology);
        let services = bounded("service discovery", timeouts.discover, peripheral.discover_services())
            .await?;
        debug!("{id}: {} service(s) discovered", services.len());
        endpoints.resolve(&services)?;
        info!("{id}: service {} resolved", endpoints.service);

        on_step(ConnectionState::SubscribingNotifications);
        peripheral.subscribe(endpoints.service, endpoints.notify).await
    }
    .await;

    match result {
        Ok(notifications) => {
            info!("{id}: notifications active");
            Ok(Session {
                handle: PeripheralHandle {
                    peripheral,
                    endpoints,
                },
                notifications,
            })
        }
        Err(e) => {
            warn!("{id}: establishment failed: {e}");
            if let Err(de) = peripheral.disconnect().await {
                debug!("{id}: disconnect after failed establishment: {de}");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mock::MockPlatform;
    use crate::platform::Platform;
    use crate::protocol::{
        CONNECT_TIMEOUT, DISCOVER_TIMEOUT, NOTIFY_CHARACTERISTIC, SERVICE_UUID,
        WRITE_CHARACTERISTIC,
    };

    const ENDPOINTS: Endpoints = Endpoints {
        service: SERVICE_UUID,
        notify: NOTIFY_CHARACTERISTIC,
        write: WRITE_CHARACTERISTIC,
    };

    const TIMEOUTS: StepTimeouts = StepTimeouts {
        connect: CONNECT_TIMEOUT,
        discover: DISCOVER_TIMEOUT,
    };

    async fn peripheral(platform: &MockPlatform) -> crate::mock::MockPeripheral {
        let radio = Arc::new(platform.open_radio().await.unwrap());
        match crate::discovery::scan_for(radio, crate::protocol::DEVICE_NAME, TIMEOUTS.discover)
            .await
            .unwrap()
        {
            crate::discovery::Discovery::Found(p) => p,
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn steps_run_in_order() {
        let platform = MockPlatform::new();
        let p = peripheral(&platform).await;

        let mut steps = Vec::new();
        let session = establish(p, ENDPOINTS, TIMEOUTS, |s| steps.push(s))
            .await
            .unwrap();
        assert_eq!(
            steps,
            [
                ConnectionState::Connecting,
                ConnectionState::DiscoveringTopology,
                ConnectionState::SubscribingNotifications,
            ]
        );
        assert_eq!(session.handle.endpoints, ENDPOINTS);
        let counters = platform.counters();
        assert_eq!(counters.connects, 1);
        assert_eq!(counters.subscribes, 1);
        assert_eq!(counters.disconnects, 0);
    }

    #[tokio::test]
    async fn missing_service_aborts_and_disconnects() {
        let platform = MockPlatform::new().with_services(vec![ServiceInfo {
            uuid: Uuid::from_u128(0x180d),
            characteristics: vec![Uuid::from_u128(0x2a37)],
        }]);
        let p = peripheral(&platform).await;

        let err = establish(p, ENDPOINTS, TIMEOUTS, |_| {}).await.unwrap_err();
        assert_eq!(err, LinkError::ServiceNotFound(SERVICE_UUID));
        let counters = platform.counters();
        assert_eq!(counters.subscribes, 0);
        assert_eq!(counters.disconnects, 1);
    }

    #[tokio::test]
    async fn missing_characteristic_names_the_endpoint() {
        let platform = MockPlatform::new().with_services(vec![ServiceInfo {
            uuid: SERVICE_UUID,
            characteristics: vec![NOTIFY_CHARACTERISTIC],
        }]);
        let p = peripheral(&platform).await;

        let err = establish(p, ENDPOINTS, TIMEOUTS, |_| {}).await.unwrap_err();
        assert_eq!(
            err,
            LinkError::CharacteristicNotFound {
                endpoint: Endpoint::Write,
                service: SERVICE_UUID,
                uuid: WRITE_CHARACTERISTIC,
            }
        );
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let platform =
            MockPlatform::new().failing_connect(LinkError::Platform("le-connection-abort".into()));
        let p = peripheral(&platform).await;

        let mut steps = Vec::new();
        let err = establish(p, ENDPOINTS, TIMEOUTS, |s| steps.push(s))
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::Platform("le-connection-abort".into()));
        assert_eq!(steps, [ConnectionState::Connecting]);
    }

    #[test]
    fn resolve_is_exact_on_uuid() {
        let services = vec![ServiceInfo {
            uuid: SERVICE_UUID,
            characteristics: vec![WRITE_CHARACTERISTIC, NOTIFY_CHARACTERISTIC],
        }];
        assert!(ENDPOINTS.resolve(&services).is_ok());
        assert!(ENDPOINTS.resolve(&[]).is_err());
    }
}
