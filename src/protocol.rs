//! GATT identifiers, timing constants, and wire-format helpers for the
//! HaloFit Headband.
//!
//! The headband exposes the Nordic UART Service (NUS): one characteristic the
//! device notifies into, one the host writes commands to.  All UUIDs live in
//! the Nordic vendor namespace `6e40XXXX-b5a3-f393-e0a9-e50e24dcca9e`.

use std::time::Duration;

use uuid::Uuid;

use crate::error::LinkError;

// ── Advertisement ────────────────────────────────────────────────────────────

/// Advertised local name of the headband.
///
/// Discovery filters on this exact name rather than on the service UUID:
/// service-UUID scan filters are not honoured consistently by every platform
/// stack, and the headband does not always include the UUID in its
/// advertisement payload.
pub const DEVICE_NAME: &str = "HaloFit Headband";

// ── Service ──────────────────────────────────────────────────────────────────

/// Nordic UART service carrying all sensor traffic.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

// ── Characteristics ──────────────────────────────────────────────────────────

/// TX characteristic: the headband notifies sensor readings into it.
pub const NOTIFY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// RX characteristic: the host writes commands into it.
///
/// Resolved during session establishment but not used for data ingestion.
pub const WRITE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

// ── Timing ───────────────────────────────────────────────────────────────────

/// How long discovery waits for a matching advertisement.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(15);

/// Back-off before the single automatic reconnect after a cancelled platform
/// operation.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Hard bound on the physical connect.  BlueZ can block forever on
/// `Device1.Connect` when the peripheral walks out of range mid-handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard bound on GATT service enumeration.
pub const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

// ── Payload markers ──────────────────────────────────────────────────────────

/// Lower-cased prefix of the periodic battery-status line the firmware
/// interleaves with sensor readings.
pub const BATTERY_MARKER: &str = "battery:";

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Parse a textual GATT identifier.
///
/// Accepts any letter case, with or without hyphens, as platform stacks
/// differ in how they render UUIDs.
pub fn parse_identifier(text: &str) -> Result<Uuid, LinkError> {
    Uuid::parse_str(text.trim()).map_err(|e| LinkError::InvalidIdentifier {
        text: text.to_owned(),
        reason: e.to_string(),
    })
}

/// Case-insensitive comparison of two textual identifiers.
///
/// Falls back to an ASCII case-insensitive string comparison when either side
/// is not a well-formed UUID (e.g. a 16-bit short form).
pub fn same_identifier(a: &str, b: &str) -> bool {
    match (parse_identifier(a), parse_identifier(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.trim().eq_ignore_ascii_case(b.trim()),
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

/// Encode a text command for the write endpoint.
///
/// The firmware reads line-oriented ASCII over the UART service, so a command
/// is its bytes followed by a single `'\n'`.  A trailing newline already
/// present in `cmd` is not doubled.
///
/// ```
/// # use halofit_link::protocol::encode_command;
/// assert_eq!(encode_command("reset"), b"reset\n");
/// ```
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut bytes = cmd.trim_end_matches(&['\r', '\n'][..]).as_bytes().to_vec();
    bytes.push(b'\n');
    bytes
}
