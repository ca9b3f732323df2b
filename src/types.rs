use serde::Serialize;

/// One decoded reading from the headband.
///
/// The device counters (`calories`, `step_count`) are cumulative over the
/// device's lifetime, not per workout.  Subtracting a start-of-workout
/// baseline is up to the caller; see [`crate::workout::WorkoutBaseline`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// Heart rate in beats per minute.
    pub heart_rate: u32,
    /// Cumulative energy expenditure in kcal.
    pub calories: f64,
    /// Cumulative step count.
    pub step_count: u64,
    /// Local wall-clock time of receipt in milliseconds since Unix epoch.
    ///
    /// Never taken from the payload; the headband clock is not trusted.
    /// Non-decreasing within one session.
    pub timestamp: f64,
}

/// Connection lifecycle of a [`crate::link::DeviceLink`].
///
/// Exactly one state is current at any time.  The happy path runs
/// `Idle → PermissionPending → Scanning → Connecting → DiscoveringTopology →
/// SubscribingNotifications → Active`; teardown passes through
/// `Disconnecting` into `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    PermissionPending,
    Scanning,
    Connecting,
    DiscoveringTopology,
    SubscribingNotifications,
    Active,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// `true` while a connection attempt is running, i.e. a new `connect()`
    /// must be rejected.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ConnectionState::PermissionPending
                | ConnectionState::Scanning
                | ConnectionState::Connecting
                | ConnectionState::DiscoveringTopology
                | ConnectionState::SubscribingNotifications
        )
    }

    /// `true` when there is nothing left for `disconnect()` to tear down.
    pub fn is_at_rest(self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Disconnected)
    }
}

/// Events delivered through [`crate::link::DeviceLink::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A decoded reading.  Only produced while the link is `Active`.
    Sample(Sample),
    /// A connection-state transition as seen by the caller: `true` once the
    /// notification subscription is live, `false` on any failure or loss.
    Connection(bool),
}
