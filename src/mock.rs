//! Scriptable in-memory Bluetooth stack.
//!
//! [`MockPlatform`] implements the [`crate::platform`] traits without any
//! hardware so the link manager's state machine can be driven from tests:
//! advertisements, topology and failures are configured up front, and
//! notifications, subscription errors and link drops are injected while a
//! session is live.
//!
//! ```no_run
//! use halofit_link::mock::MockPlatform;
//! use halofit_link::link::{DeviceLink, LinkConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let platform = MockPlatform::new();
//! let link = DeviceLink::new(platform.clone(), LinkConfig::default());
//! let mut events = link.events();
//! link.connect().await;
//! platform.notify(b"BPM: 80 | Cal:57.11 kcal | Steps:  262");
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::error::LinkError;
use crate::platform::{
    Advertisement, AdvertisementStream, NotificationStream, Peripheral, Platform, Radio,
    RadioState, ServiceInfo,
};
use crate::protocol::{DEVICE_NAME, NOTIFY_CHARACTERISTIC, SERVICE_UUID, WRITE_CHARACTERISTIC};

/// Snapshot of everything the mock stack has been asked to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockCounters {
    pub radios_opened: usize,
    pub radios_shut_down: usize,
    pub scans_started: usize,
    pub scans_stopped: usize,
    pub connects: usize,
    pub disconnects: usize,
    pub subscribes: usize,
    pub unsubscribes: usize,
    pub writes: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct MockState {
    permission: bool,
    radio_state: RadioState,
    advertisements: Vec<Option<String>>,
    services: Vec<ServiceInfo>,
    connect_error: Option<LinkError>,
    notifier: Option<mpsc::UnboundedSender<Result<Vec<u8>, LinkError>>>,
    counters: MockCounters,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            permission: true,
            radio_state: RadioState::PoweredOn,
            advertisements: vec![Some(DEVICE_NAME.to_owned())],
            services: vec![
                ServiceInfo {
                    uuid: Uuid::from_u128(0x1800),
                    characteristics: vec![Uuid::from_u128(0x2a00)],
                },
                ServiceInfo {
                    uuid: SERVICE_UUID,
                    characteristics: vec![WRITE_CHARACTERISTIC, NOTIFY_CHARACTERISTIC],
                },
            ],
            connect_error: None,
            notifier: None,
            counters: MockCounters::default(),
        }
    }
}

/// In-memory [`Platform`].  Clones share state.
///
/// By default permission is granted, the radio is powered on, one scan yields
/// a single `"HaloFit Headband"` advertisement, and the device exposes the
/// Nordic UART service with both characteristics.
#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Setup ────────────────────────────────────────────────────────────────

    pub fn without_permission(self) -> Self {
        lock(&self.state).permission = false;
        self
    }

    pub fn with_radio_state(self, radio_state: RadioState) -> Self {
        lock(&self.state).radio_state = radio_state;
        self
    }

    /// Names advertised, in order, by every scan.  After the list is exhausted
    /// the scan stays open but silent.
    pub fn with_advertisements<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        lock(&self.state).advertisements = names.into_iter().map(|n| n.map(Into::into)).collect();
        self
    }

    pub fn with_no_advertisements(self) -> Self {
        lock(&self.state).advertisements.clear();
        self
    }

    pub fn with_services(self, services: Vec<ServiceInfo>) -> Self {
        lock(&self.state).services = services;
        self
    }

    pub fn failing_connect(self, error: LinkError) -> Self {
        lock(&self.state).connect_error = Some(error);
        self
    }

    // ── Live injection ───────────────────────────────────────────────────────

    /// Deliver a notification on the current subscription.  Returns `false`
    /// when nothing is subscribed.
    pub fn notify(&self, payload: &[u8]) -> bool {
        self.push(Ok(payload.to_vec()))
    }

    /// Fail the current subscription with `error`.
    pub fn fail_subscription(&self, error: LinkError) -> bool {
        self.push(Err(error))
    }

    /// End the current subscription as if the peripheral dropped the link.
    pub fn drop_link(&self) -> bool {
        lock(&self.state).notifier.take().is_some()
    }

    fn push(&self, item: Result<Vec<u8>, LinkError>) -> bool {
        let state = lock(&self.state);
        match &state.notifier {
            Some(tx) => tx.unbounded_send(item).is_ok(),
            None => false,
        }
    }

    pub fn counters(&self) -> MockCounters {
        lock(&self.state).counters.clone()
    }

    /// Allow or deny permission from now on.
    pub fn set_permission(&self, granted: bool) {
        lock(&self.state).permission = granted;
    }

    /// Make later `connect` calls fail with `error`, or succeed with `None`.
    pub fn set_connect_failure(&self, error: Option<LinkError>) {
        lock(&self.state).connect_error = error;
    }
}

#[async_trait]
impl Platform for MockPlatform {
    type Radio = MockRadio;

    async fn request_permissions(&self) -> bool {
        lock(&self.state).permission
    }

    async fn open_radio(&self) -> Result<MockRadio, LinkError> {
        lock(&self.state).counters.radios_opened += 1;
        Ok(MockRadio {
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub struct MockRadio {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Radio for MockRadio {
    type Peripheral = MockPeripheral;

    async fn state(&self) -> Result<RadioState, LinkError> {
        Ok(lock(&self.state).radio_state)
    }

    async fn start_scan(&self) -> Result<AdvertisementStream<MockPeripheral>, LinkError> {
        let names = {
            let mut state = lock(&self.state);
            state.counters.scans_started += 1;
            state.advertisements.clone()
        };
        let shared = Arc::clone(&self.state);
        let adverts = names.into_iter().map(move |name| {
            Ok(Advertisement {
                peripheral: MockPeripheral {
                    name: name.clone().unwrap_or_default(),
                    state: Arc::clone(&shared),
                },
                name,
            })
        });
        Ok(stream::iter(adverts).chain(stream::pending()).boxed())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        lock(&self.state).counters.scans_stopped += 1;
        Ok(())
    }

    async fn shutdown(&self) {
        lock(&self.state).counters.radios_shut_down += 1;
    }
}

#[derive(Clone)]
pub struct MockPeripheral {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeripheral")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MockPeripheral {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Peripheral for MockPeripheral {
    fn id(&self) -> String {
        format!("mock:{}", self.name)
    }

    async fn connect(&self) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        state.counters.connects += 1;
        match &state.connect_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, LinkError> {
        Ok(lock(&self.state).services.clone())
    }

    async fn subscribe(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<NotificationStream, LinkError> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = lock(&self.state);
        state.counters.subscribes += 1;
        state.notifier = Some(tx);
        Ok(rx.boxed())
    }

    async fn unsubscribe(&self, _service: Uuid, _characteristic: Uuid) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        state.counters.unsubscribes += 1;
        state.notifier = None;
        Ok(())
    }

    async fn write(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), LinkError> {
        lock(&self.state).counters.writes.push(data.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        state.counters.disconnects += 1;
        state.notifier = None;
        Ok(())
    }
}
