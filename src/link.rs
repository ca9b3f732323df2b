//! The device link manager and its recovery controller.
//!
//! [`DeviceLink`] drives one logical session with the headband through the
//! [`Platform`] seam:
//!
//! ```text
//! connect() ─► PermissionPending ─► Scanning ─► Connecting ─► DiscoveringTopology
//!                                                                   │
//!         Disconnected ◄── Disconnecting ◄── disconnect()           ▼
//!               ▲                                      SubscribingNotifications
//!               └──── failure / link loss ◄──── Active ◄────────────┘
//! ```
//!
//! Background work (the connection attempt, the notification pump, the
//! reconnect timer) runs on spawned tokio tasks.  Every task captures the
//! session *epoch* it was started under; `connect()`, `disconnect()`,
//! `destroy()` and the recovery paths bump the epoch, so results from stale
//! work are discarded instead of overwriting newer state.
//!
//! Callbacks are always invoked with the internal lock released, so they may
//! call back into the manager (`destroy()` directly, `disconnect()` by spawning
//! it).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::discovery;
use crate::error::LinkError;
use crate::parse::{self, Decoded, PayloadEncoding};
use crate::platform::{NotificationStream, Peripheral, Platform, Radio};
use crate::protocol::{
    self, CONNECT_TIMEOUT, DEVICE_NAME, DISCOVER_TIMEOUT, NOTIFY_CHARACTERISTIC,
    RECONNECT_DELAY, SCAN_TIMEOUT, SERVICE_UUID, WRITE_CHARACTERISTIC,
};
use crate::session::{self, Endpoints, PeripheralHandle, Session, StepTimeouts};
use crate::types::{ConnectionState, LinkEvent, Sample};

// ── LinkConfig ───────────────────────────────────────────────────────────────

/// Configuration for [`DeviceLink`].
///
/// The defaults are the literal values the headband firmware expects; there is
/// normally no reason to change anything except the timings in tests.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Exact advertised name to connect to.  Default: `"HaloFit Headband"`.
    pub device_name: String,
    pub service: Uuid,
    pub notify_characteristic: Uuid,
    pub write_characteristic: Uuid,
    /// How long discovery waits for a matching advertisement.  Default: 15 s.
    pub scan_timeout: Duration,
    /// Bound on the physical connect.  Default: 10 s.
    pub connect_timeout: Duration,
    /// Bound on service enumeration.  Default: 15 s.
    pub discover_timeout: Duration,
    /// Back-off before the automatic reconnect.  Default: 2 s.
    pub reconnect_delay: Duration,
    pub payload_encoding: PayloadEncoding,
    /// Also schedule one reconnect after an ordinary peripheral-initiated
    /// drop, not only after a platform cancellation.  Default: `false`.
    pub reconnect_on_link_loss: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: DEVICE_NAME.into(),
            service: SERVICE_UUID,
            notify_characteristic: NOTIFY_CHARACTERISTIC,
            write_characteristic: WRITE_CHARACTERISTIC,
            scan_timeout: SCAN_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            discover_timeout: DISCOVER_TIMEOUT,
            reconnect_delay: RECONNECT_DELAY,
            payload_encoding: PayloadEncoding::default(),
            reconnect_on_link_loss: false,
        }
    }
}

impl LinkConfig {
    /// Override the GATT identifiers from their textual form, in any case.
    pub fn with_identifiers(
        mut self,
        service: &str,
        notify: &str,
        write: &str,
    ) -> Result<Self, LinkError> {
        self.service = protocol::parse_identifier(service)?;
        self.notify_characteristic = protocol::parse_identifier(notify)?;
        self.write_characteristic = protocol::parse_identifier(write)?;
        Ok(self)
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            service: self.service,
            notify: self.notify_characteristic,
            write: self.write_characteristic,
        }
    }

    pub fn timeouts(&self) -> StepTimeouts {
        StepTimeouts {
            connect: self.connect_timeout,
            discover: self.discover_timeout,
        }
    }
}

// ── Receipt clock ────────────────────────────────────────────────────────────

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Stamps samples with the local receipt time.
///
/// The wall clock can step backwards (NTP, manual changes); samples within one
/// session must not, so a stamp is never lower than the previous one.
#[derive(Debug, Default)]
struct ReceiptClock {
    last: f64,
}

impl ReceiptClock {
    fn stamp_at(&mut self, now: f64) -> f64 {
        self.last = self.last.max(now);
        self.last
    }

    fn stamp(&mut self) -> f64 {
        self.stamp_at(now_ms())
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

type PeripheralOf<P> = <<P as Platform>::Radio as Radio>::Peripheral;
type DataCallback = Arc<dyn Fn(Sample) + Send + Sync>;
type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct ActiveLink<T> {
    handle: PeripheralHandle<T>,
    /// `None` until the connection callback has returned.
    pump: Option<JoinHandle<()>>,
}

struct Shared<P: Platform> {
    phase: ConnectionState,
    epoch: u64,
    destroyed: bool,
    radio: Option<Arc<P::Radio>>,
    attempt: Option<JoinHandle<()>>,
    /// Peripheral between discovery and a completed establishment; the only
    /// reference `disconnect()` has to it while the attempt is in flight.
    establishing: Option<PeripheralOf<P>>,
    active: Option<ActiveLink<PeripheralOf<P>>>,
    reconnect: Option<JoinHandle<()>>,
    last_failure: Option<LinkError>,
    /// Epoch of a recovery that has torn the session down but not yet told
    /// the caller.  Whoever takes it reports `connected = false`.
    owed_disconnect: Option<u64>,
    on_data: Option<DataCallback>,
    on_connection: Option<ConnectionCallback>,
}

impl<P: Platform> Shared<P> {
    fn transition(&mut self, to: ConnectionState) {
        if self.phase != to {
            debug!("link state {:?} -> {to:?}", self.phase);
            self.phase = to;
        }
    }

    /// `connect()` must be rejected in these states.
    fn is_busy(&self) -> bool {
        self.phase.is_in_flight()
            || matches!(
                self.phase,
                ConnectionState::Active | ConnectionState::Disconnecting
            )
    }

    fn is_current(&self, epoch: u64) -> bool {
        !self.destroyed && self.epoch == epoch
    }
}

struct Inner<P: Platform> {
    platform: P,
    config: LinkConfig,
    shared: Mutex<Shared<P>>,
}

// ── DeviceLink ───────────────────────────────────────────────────────────────

/// Connection manager for one HaloFit Headband.
///
/// Cheap to clone; clones share the same session.  Must be used from within a
/// tokio runtime.
///
/// # Example
///
/// ```no_run
/// use halofit_link::prelude::*;
///
/// # async fn run<P: Platform>(platform: P) {
/// let link = DeviceLink::new(platform, LinkConfig::default());
/// link.on_data(|s| println!("{} bpm", s.heart_rate));
/// link.on_connection_change(|up| println!("connected: {up}"));
/// if !link.connect().await {
///     eprintln!("could not start: {:?}", link.last_failure());
/// }
/// # }
/// ```
pub struct DeviceLink<P: Platform> {
    inner: Arc<Inner<P>>,
}

impl<P: Platform> Clone for DeviceLink<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Platform> std::fmt::Debug for DeviceLink<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("DeviceLink")
            .field("device_name", &self.inner.config.device_name)
            .field("phase", &shared.phase)
            .field("destroyed", &shared.destroyed)
            .finish_non_exhaustive()
    }
}

impl<P: Platform> DeviceLink<P> {
    pub fn new(platform: P, config: LinkConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                platform,
                config,
                shared: Mutex::new(Shared {
                    phase: ConnectionState::Idle,
                    epoch: 0,
                    destroyed: false,
                    radio: None,
                    attempt: None,
                    establishing: None,
                    active: None,
                    reconnect: None,
                    last_failure: None,
                    owed_disconnect: None,
                    on_data: None,
                    on_connection: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Start discovery and session establishment.
    ///
    /// Returns whether the attempt was *initiated*: `false` if the manager is
    /// destroyed, already connecting or connected, or the permission / radio
    /// preflight failed.  The outcome of an initiated attempt arrives through
    /// the connection-change callback.  A preflight failure is also reported
    /// there as `false`.
    pub async fn connect(&self) -> bool {
        self.inner.connect().await
    }

    /// Tear down the active or in-progress session.
    ///
    /// Cancels a pending reconnect, stops an in-progress scan or connect, and
    /// releases the subscription and peripheral.  Reports `false` once; calling
    /// it again, or while nothing is connected, does nothing.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    /// Release every resource permanently.
    ///
    /// Idempotent.  After the first call no callback fires again and every
    /// other operation is rejected or ignored.  The platform resources are
    /// released on a background task.
    pub fn destroy(&self) {
        self.inner.destroy()
    }

    /// Whether a peripheral handle is currently held.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().phase
    }

    /// The most recent terminal failure, cleared by the next `connect()`.
    pub fn last_failure(&self) -> Option<LinkError> {
        self.inner.lock().last_failure.clone()
    }

    /// A reconnect timer is armed.  Already true when the `connected = false`
    /// that scheduled it is delivered.
    pub fn reconnect_pending(&self) -> bool {
        self.inner.lock().reconnect.is_some()
    }

    /// Register the consumer of decoded samples, replacing any earlier one.
    pub fn on_data<F>(&self, callback: F)
    where
        F: Fn(Sample) + Send + Sync + 'static,
    {
        let mut shared = self.inner.lock();
        if !shared.destroyed {
            shared.on_data = Some(Arc::new(callback));
        }
    }

    /// Register the consumer of connection transitions, replacing any
    /// earlier one.
    pub fn on_connection_change<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut shared = self.inner.lock();
        if !shared.destroyed {
            shared.on_connection = Some(Arc::new(callback));
        }
    }

    /// Receive samples and connection transitions on a channel instead of
    /// callbacks.
    ///
    /// Installs forwarding callbacks for both, so it replaces whatever was
    /// registered before.  The channel closes when the manager is destroyed
    /// or another consumer is registered for both event kinds.
    pub fn events(&self) -> mpsc::UnboundedReceiver<LinkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let data_tx = tx.clone();
        self.on_data(move |sample| {
            let _ = data_tx.send(LinkEvent::Sample(sample));
        });
        self.on_connection_change(move |connected| {
            let _ = tx.send(LinkEvent::Connection(connected));
        });
        rx
    }

    /// Write a newline-terminated text command to the write endpoint.
    pub async fn send_command(&self, command: &str) -> Result<(), LinkError> {
        let handle = {
            let shared = self.inner.lock();
            if shared.destroyed {
                return Err(LinkError::Destroyed);
            }
            match (&shared.active, shared.phase) {
                (Some(active), ConnectionState::Active) => active.handle.clone(),
                _ => return Err(LinkError::NotConnected),
            }
        };
        debug!("send_command: {command:?}");
        handle.write(&protocol::encode_command(command)).await
    }
}

// ── Inner ────────────────────────────────────────────────────────────────────

impl<P: Platform> Inner<P> {
    fn lock(&self) -> MutexGuard<'_, Shared<P>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_connection(&self, connected: bool) {
        let callback = {
            let shared = self.lock();
            if shared.destroyed {
                return;
            }
            shared.on_connection.clone()
        };
        if let Some(callback) = callback {
            callback(connected);
        }
    }

    /// Move to `step` if `epoch` is still the live one.
    fn advance(&self, epoch: u64, step: ConnectionState) -> bool {
        let mut shared = self.lock();
        if !shared.is_current(epoch) {
            return false;
        }
        shared.transition(step);
        true
    }

    // ── connect ──────────────────────────────────────────────────────────────

    async fn connect(self: &Arc<Self>) -> bool {
        let (epoch, owed) = {
            let mut shared = self.lock();
            if shared.destroyed {
                debug!("connect() ignored: {}", LinkError::Destroyed);
                return false;
            }
            if shared.is_busy() {
                warn!("connect() rejected in state {:?}: {}", shared.phase, LinkError::Busy);
                return false;
            }
            if let Some(timer) = shared.reconnect.take() {
                timer.abort();
            }
            shared.epoch += 1;
            shared.last_failure = None;
            shared.transition(ConnectionState::PermissionPending);
            (shared.epoch, shared.owed_disconnect.take())
        };
        if owed.is_some() {
            // The interrupted recovery never got to report its loss.
            self.emit_connection(false);
        }

        let radio = match self.preflight().await {
            Ok(radio) => radio,
            Err(e) => {
                self.fail(epoch, e).await;
                return false;
            }
        };

        let mut shared = self.lock();
        if !shared.is_current(epoch) {
            return false;
        }
        shared.transition(ConnectionState::Scanning);
        let attempt = tokio::spawn(Arc::clone(self).run_attempt(epoch, radio));
        shared.attempt = Some(attempt);
        true
    }

    /// Decides whether `connect()` initiates anything.  The attempt repeats
    /// the checks through [`discovery::start_discovery`] right before scanning.
    async fn preflight(&self) -> Result<Arc<P::Radio>, LinkError> {
        discovery::check_permission(&self.platform).await?;
        let radio = self.ensure_radio().await?;
        discovery::check_radio(radio.as_ref()).await?;
        Ok(radio)
    }

    /// The current radio, opening one on first use.
    async fn ensure_radio(&self) -> Result<Arc<P::Radio>, LinkError> {
        let existing = self.lock().radio.clone();
        if let Some(radio) = existing {
            return Ok(radio);
        }

        let opened = Arc::new(self.platform.open_radio().await?);
        debug!("radio opened");
        let (radio, stale) = {
            let mut shared = self.lock();
            if shared.destroyed {
                (Err(LinkError::Destroyed), Some(opened))
            } else if let Some(winner) = shared.radio.clone() {
                (Ok(winner), Some(opened))
            } else {
                shared.radio = Some(Arc::clone(&opened));
                (Ok(opened), None)
            }
        };
        if let Some(stale) = stale {
            stale.shutdown().await;
        }
        radio
    }

    async fn run_attempt(self: Arc<Self>, epoch: u64, radio: Arc<P::Radio>) {
        match self.establish_session(epoch, radio).await {
            Ok(session) => self.activate(epoch, session).await,
            Err(LinkError::Superseded) => debug!("attempt {epoch} superseded"),
            Err(e) => self.fail(epoch, e).await,
        }
    }

    async fn establish_session(
        &self,
        epoch: u64,
        radio: Arc<P::Radio>,
    ) -> Result<Session<PeripheralOf<P>>, LinkError> {
        let name = self.config.device_name.as_str();
        let window = self.config.scan_timeout;
        let peripheral = discovery::start_discovery(&self.platform, radio, name, window)
            .await?
            .into_result(name, window)?;

        {
            let mut shared = self.lock();
            if !shared.is_current(epoch) {
                return Err(LinkError::Superseded);
            }
            shared.establishing = Some(peripheral.clone());
        }

        let result = session::establish(
            peripheral,
            self.config.endpoints(),
            self.config.timeouts(),
            |step| {
                self.advance(epoch, step);
            },
        )
        .await;

        let current = {
            let mut shared = self.lock();
            let current = shared.is_current(epoch);
            if current {
                shared.establishing = None;
            }
            current
        };
        if current {
            return result;
        }
        if let Ok(session) = result {
            session.handle.release().await;
        }
        Err(LinkError::Superseded)
    }

    async fn activate(self: Arc<Self>, epoch: u64, session: Session<PeripheralOf<P>>) {
        let Session {
            handle,
            notifications,
        } = session;

        let accepted = {
            let mut shared = self.lock();
            if shared.is_current(epoch) {
                shared.transition(ConnectionState::Active);
                shared.active = Some(ActiveLink {
                    handle: handle.clone(),
                    pump: None,
                });
                true
            } else {
                false
            }
        };
        if !accepted {
            handle.release().await;
            return;
        }

        info!("{}: link active", handle.peripheral.id());
        self.emit_connection(true);

        // The callback may already have torn the session down.
        let mut shared = self.lock();
        if !shared.is_current(epoch) {
            return;
        }
        let pump = tokio::spawn(Arc::clone(&self).pump(epoch, notifications));
        if let Some(active) = shared.active.as_mut() {
            active.pump = Some(pump);
        }
    }

    /// Terminal failure of an attempt, or recovery if it is transient.
    async fn fail(self: &Arc<Self>, epoch: u64, error: LinkError) {
        if error.is_transient() {
            self.recover_cancelled(epoch, error).await;
            return;
        }
        {
            let mut shared = self.lock();
            if !shared.is_current(epoch) {
                return;
            }
            shared.establishing = None;
            shared.last_failure = Some(error.clone());
            shared.transition(ConnectionState::Disconnected);
        }
        warn!("connection failed: {error}");
        self.emit_connection(false);
    }

    // ── Notification pump ────────────────────────────────────────────────────

    async fn pump(self: Arc<Self>, epoch: u64, mut notifications: NotificationStream) {
        let mut clock = ReceiptClock::default();
        while let Some(item) = notifications.next().await {
            match item {
                Ok(raw) => self.deliver(epoch, &raw, clock.stamp()),
                Err(e) if e.is_transient() => {
                    drop(notifications);
                    self.recover_cancelled(epoch, e).await;
                    return;
                }
                Err(e) => {
                    drop(notifications);
                    self.link_lost(epoch, e).await;
                    return;
                }
            }
        }
        self.link_lost(epoch, LinkError::LinkLost).await;
    }

    fn deliver(&self, epoch: u64, raw: &[u8], received_at: f64) {
        let sample = match parse::decode_payload(raw, self.config.payload_encoding, received_at) {
            Ok(Decoded::Sample(sample)) => sample,
            Ok(Decoded::Ignored) => {
                trace!("ignored payload ({} bytes)", raw.len());
                return;
            }
            Err(e) => {
                debug!("dropping payload: {e}");
                return;
            }
        };
        let callback = {
            let shared = self.lock();
            if !shared.is_current(epoch) || shared.phase != ConnectionState::Active {
                return;
            }
            shared.on_data.clone()
        };
        if let Some(callback) = callback {
            callback(sample);
        }
    }

    // ── Recovery ─────────────────────────────────────────────────────────────

    /// The peripheral went away, or the subscription failed.
    async fn link_lost(self: &Arc<Self>, epoch: u64, error: LinkError) {
        let (active, epoch) = {
            let mut shared = self.lock();
            if !shared.is_current(epoch) {
                return;
            }
            shared.epoch += 1;
            shared.last_failure = Some(error.clone());
            shared.transition(ConnectionState::Disconnected);
            (shared.active.take(), shared.epoch)
        };
        warn!("link lost: {error}");
        if let Some(active) = active {
            // Not aborting the pump: this may be running on it.
            active.handle.release().await;
        }
        if self.config.reconnect_on_link_loss {
            self.schedule_reconnect(epoch);
        }
        self.emit_connection(false);
    }

    /// The platform cancelled an operation: the radio itself can no longer be
    /// trusted.  Drop everything including the radio, open a fresh one, report
    /// the disconnect, and schedule a single reconnect.
    async fn recover_cancelled(self: &Arc<Self>, epoch: u64, error: LinkError) {
        let (active, radio, epoch) = {
            let mut shared = self.lock();
            if !shared.is_current(epoch) {
                return;
            }
            shared.epoch += 1;
            shared.establishing = None;
            shared.last_failure = Some(error.clone());
            shared.owed_disconnect = Some(shared.epoch);
            shared.transition(ConnectionState::Disconnected);
            (shared.active.take(), shared.radio.take(), shared.epoch)
        };
        warn!("platform cancelled an operation, recreating radio: {error}");

        if let Some(active) = active {
            active.handle.release().await;
        }
        if let Some(radio) = radio {
            radio.shutdown().await;
        }

        match self.platform.open_radio().await {
            Ok(fresh) => {
                let fresh = Arc::new(fresh);
                let stale = {
                    let mut shared = self.lock();
                    if shared.destroyed || shared.radio.is_some() {
                        Some(fresh)
                    } else {
                        shared.radio = Some(fresh);
                        None
                    }
                };
                if let Some(stale) = stale {
                    stale.shutdown().await;
                }
            }
            // connect() opens one lazily.
            Err(e) => warn!("could not recreate radio: {e}"),
        }

        let owed = {
            let mut shared = self.lock();
            if shared.owed_disconnect == Some(epoch) {
                shared.owed_disconnect.take()
            } else {
                None
            }
        };
        self.schedule_reconnect(epoch);
        // Otherwise disconnect() or connect() already reported it.
        if owed.is_some() {
            self.emit_connection(false);
        }
    }

    /// Arm the single reconnect timer, unless the session moved on since
    /// `epoch`.
    fn schedule_reconnect(self: &Arc<Self>, epoch: u64) {
        let mut shared = self.lock();
        if !shared.is_current(epoch) {
            debug!("reconnect not scheduled: session moved on");
            return;
        }
        if let Some(previous) = shared.reconnect.take() {
            previous.abort();
        }
        let delay = self.config.reconnect_delay;
        info!("reconnecting in {} ms", delay.as_millis());

        let inner = Arc::clone(self);
        shared.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut shared = inner.lock();
                if !shared.is_current(epoch) {
                    return;
                }
                // Detach ourselves so connect() does not abort this task.
                shared.reconnect = None;
            }
            info!("reconnect attempt");
            if !inner.connect().await {
                warn!("reconnect could not be initiated");
            }
        }));
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    async fn disconnect(&self) {
        let (notify, establishing, active) = {
            let mut shared = self.lock();
            if shared.destroyed {
                return;
            }
            if let Some(timer) = shared.reconnect.take() {
                timer.abort();
            }
            if let Some(attempt) = shared.attempt.take() {
                attempt.abort();
            }
            shared.epoch += 1;
            let tearing_down = !(shared.phase.is_at_rest()
                || shared.phase == ConnectionState::Disconnecting);
            if tearing_down {
                shared.transition(ConnectionState::Disconnecting);
            }
            // Aborting the attempt may cut a recovery short of its report.
            let notify = shared.owed_disconnect.take().is_some() || tearing_down;
            (notify, shared.establishing.take(), shared.active.take())
        };

        if let Some(peripheral) = establishing {
            if let Err(e) = peripheral.disconnect().await {
                debug!("disconnect of half-established peripheral: {e}");
            }
        }
        if let Some(active) = active {
            if let Some(pump) = &active.pump {
                pump.abort();
            }
            active.handle.release().await;
        }

        if notify {
            {
                let mut shared = self.lock();
                if shared.phase == ConnectionState::Disconnecting {
                    shared.transition(ConnectionState::Disconnected);
                }
            }
            info!("disconnected on request");
            self.emit_connection(false);
        }
    }

    fn destroy(&self) {
        let (establishing, active, radio) = {
            let mut shared = self.lock();
            if shared.destroyed {
                return;
            }
            shared.destroyed = true;
            shared.epoch += 1;
            shared.transition(ConnectionState::Disconnected);
            for task in [shared.reconnect.take(), shared.attempt.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
            shared.on_data = None;
            shared.on_connection = None;
            shared.owed_disconnect = None;
            (
                shared.establishing.take(),
                shared.active.take(),
                shared.radio.take(),
            )
        };
        info!("link manager destroyed");

        if let Some(pump) = active.as_ref().and_then(|a| a.pump.as_ref()) {
            pump.abort();
        }
        if establishing.is_none() && active.is_none() && radio.is_none() {
            return;
        }
        let release = async move {
            if let Some(peripheral) = establishing {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("disconnect during destroy: {e}");
                }
            }
            if let Some(active) = active {
                active.handle.release().await;
            }
            if let Some(radio) = radio {
                radio.shutdown().await;
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(release);
            }
            Err(_) => warn!("destroy() called outside a runtime; platform resources leaked"),
        }
    }
}
