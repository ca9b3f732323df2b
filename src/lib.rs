//! # halofit-link
//!
//! Async Rust connection manager for the HaloFit Headband fitness sensor over
//! Bluetooth Low Energy.
//!
//! The headband advertises as `"HaloFit Headband"` and streams heart rate,
//! cumulative calories and cumulative steps as short text lines on a Nordic
//! UART notify characteristic.  [`link::DeviceLink`] finds it, establishes the
//! subscription, decodes every notification into a [`types::Sample`], and
//! recovers from the ways real BLE hardware fails: scan timeouts, mid-session
//! drops and operations cancelled by the platform stack.
//!
//! ## Quick start
//!
//! ```no_run
//! # #[cfg(feature = "btle")]
//! # async fn run() -> anyhow::Result<()> {
//! use halofit_link::btle::BtlePlatform;
//! use halofit_link::prelude::*;
//!
//! let link = DeviceLink::new(BtlePlatform, LinkConfig::default());
//! let mut events = link.events();
//! link.connect().await;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         LinkEvent::Sample(s) => println!("{} bpm  {:.1} kcal  {} steps", s.heart_rate, s.calories, s.step_count),
//!         LinkEvent::Connection(false) => break,
//!         LinkEvent::Connection(true) => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! | Feature | Default | Enables |
//! |---|---|---|
//! | `btle` | ✗ | [`btle`] backend over `btleplug` and the `halofit-link` binary |
//!
//! Without `btle` the crate builds without any system Bluetooth libraries;
//! [`mock`] stands in for the radio.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`link`] | [`link::DeviceLink`], its configuration and recovery controller |
//! | [`discovery`] | Permission and radio preflight, name-filtered scan |
//! | [`session`] | Connect, resolve the GATT topology, subscribe |
//! | [`parse`] | Stateless payload decoders |
//! | [`platform`] | Traits the manager drives a Bluetooth stack through |
//! | [`types`] | Samples, connection states, events |
//! | [`protocol`] | Device name, GATT UUIDs, timing constants, command framing |
//! | [`error`] | Error taxonomy |
//! | [`workout`] | Caller-side baselining of the lifetime counters |
//! | [`mock`] | Scriptable in-memory platform |

#[cfg(feature = "btle")]
pub mod btle;
pub mod discovery;
pub mod error;
pub mod link;
pub mod mock;
pub mod parse;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod types;
pub mod workout;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// ```no_run
/// use halofit_link::prelude::*;
///
/// # async fn run<P: Platform>(platform: P) {
/// let link = DeviceLink::new(platform, LinkConfig::default());
/// let mut summary = WorkoutSummary::new();
/// let mut events = link.events();
/// link.connect().await;
/// while let Some(LinkEvent::Sample(s)) = events.recv().await {
///     let delta = summary.record(&s);
///     println!("{:.1} kcal this workout", delta.calories);
/// }
/// # }
/// ```
pub mod prelude {
    // ── Manager ───────────────────────────────────────────────────────────────
    pub use crate::link::{DeviceLink, LinkConfig};
    pub use crate::platform::{Peripheral, Platform, Radio, RadioState};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::error::LinkError;
    pub use crate::parse::PayloadEncoding;
    pub use crate::types::{ConnectionState, LinkEvent, Sample};
    pub use crate::workout::{WorkoutBaseline, WorkoutSummary};

    // ── Protocol constants ────────────────────────────────────────────────────
    pub use crate::protocol::{
        DEVICE_NAME, NOTIFY_CHARACTERISTIC, SCAN_TIMEOUT, SERVICE_UUID, WRITE_CHARACTERISTIC,
    };
}
