//! Finding the headband: permission and radio preflight, then a name-filtered
//! scan bounded by a timeout.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, trace, warn};

use crate::error::LinkError;
use crate::platform::{Platform, Radio, RadioState};

/// Outcome of one discovery attempt.
#[derive(Debug, Clone)]
pub enum Discovery<P> {
    Found(P),
    NotFound,
    PermissionDenied,
    /// The radio reported something other than `PoweredOn`.
    RadioUnavailable(RadioState),
}

impl<P> Discovery<P> {
    /// Collapse into the peripheral or the matching [`LinkError`].
    pub fn into_result(self, name: &str, window: Duration) -> Result<P, LinkError> {
        match self {
            Discovery::Found(p) => Ok(p),
            Discovery::NotFound => Err(LinkError::DiscoveryTimeout {
                name: name.to_owned(),
                after: window,
            }),
            Discovery::PermissionDenied => Err(LinkError::PermissionDenied),
            Discovery::RadioUnavailable(state) => Err(LinkError::RadioUnavailable(state)),
        }
    }
}

// ── Preflight ────────────────────────────────────────────────────────────────

pub async fn check_permission<P: Platform>(platform: &P) -> Result<(), LinkError> {
    if platform.request_permissions().await {
        Ok(())
    } else {
        Err(LinkError::PermissionDenied)
    }
}

/// Fail fast unless the radio reports `PoweredOn`.
pub async fn check_radio<R: Radio>(radio: &R) -> Result<(), LinkError> {
    match radio.state().await? {
        RadioState::PoweredOn => Ok(()),
        other => Err(LinkError::RadioUnavailable(other)),
    }
}

// ── Scan guard ───────────────────────────────────────────────────────────────

/// A running scan.  Stops it exactly once: either through [`ActiveScan::stop`]
/// or, if the owning future is dropped mid-scan, from `Drop`.
struct ActiveScan<R: Radio> {
    radio: Arc<R>,
    live: bool,
}

impl<R: Radio> ActiveScan<R> {
    fn new(radio: Arc<R>) -> Self {
        Self { radio, live: true }
    }

    async fn stop(mut self) {
        self.live = false;
        match self.radio.stop_scan().await {
            Ok(()) => debug!("scan stopped"),
            Err(e) => warn!("stop_scan failed: {e}"),
        }
    }
}

impl<R: Radio> Drop for ActiveScan<R> {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        let radio = Arc::clone(&self.radio);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = radio.stop_scan().await {
                        warn!("stop_scan after abandoned discovery failed: {e}");
                    }
                });
            }
            Err(_) => warn!("discovery abandoned outside a runtime; scan left running"),
        }
    }
}

// ── Scan ─────────────────────────────────────────────────────────────────────

/// Scan until a peripheral advertises exactly `name`, or `window` elapses.
///
/// The first match is claimed and the scan stops immediately; advertisements
/// that arrive afterwards are never looked at.
pub async fn scan_for<R: Radio>(
    radio: Arc<R>,
    name: &str,
    window: Duration,
) -> Result<Discovery<R::Peripheral>, LinkError> {
    let mut adverts = match radio.start_scan().await {
        Ok(s) => s,
        Err(LinkError::PermissionDenied) => return Ok(Discovery::PermissionDenied),
        Err(e) => return Err(e),
    };
    let scan = ActiveScan::new(Arc::clone(&radio));
    info!("Scanning for \"{name}\" (timeout: {} s) …", window.as_secs());

    let result = tokio::time::timeout(window, async {
        let mut seen: u64 = 0;
        while let Some(advert) = adverts.next().await {
            let advert = advert?;
            seen += 1;
            if advert.name.as_deref() == Some(name) {
                return Ok(Some((advert.peripheral, seen)));
            }
            trace!("ignoring advertisement {:?}", advert.name);
        }
        Ok::<_, LinkError>(None)
    })
    .await;

    drop(adverts);
    scan.stop().await;

    match result {
        Ok(Ok(Some((peripheral, seen)))) => {
            info!("Found \"{name}\" after {seen} advertisement(s)");
            Ok(Discovery::Found(peripheral))
        }
        Ok(Ok(None)) => {
            warn!("advertisement stream ended before \"{name}\" was seen");
            Ok(Discovery::NotFound)
        }
        Ok(Err(LinkError::PermissionDenied)) => Ok(Discovery::PermissionDenied),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            info!("Scan timeout: \"{name}\" not found after {} s", window.as_secs());
            Ok(Discovery::NotFound)
        }
    }
}

/// Full discovery: permission, radio state, then [`scan_for`].
pub async fn start_discovery<P: Platform>(
    platform: &P,
    radio: Arc<P::Radio>,
    name: &str,
    window: Duration,
) -> Result<Discovery<<P::Radio as Radio>::Peripheral>, LinkError> {
    if check_permission(platform).await.is_err() {
        return Ok(Discovery::PermissionDenied);
    }
    match check_radio(radio.as_ref()).await {
        Ok(()) => {}
        Err(LinkError::RadioUnavailable(state)) => {
            warn!("radio not powered on ({state:?})");
            return Ok(Discovery::RadioUnavailable(state));
        }
        Err(e) => return Err(e),
    }
    scan_for(radio, name, window).await
}
