//! Decoders for HaloFit notification payloads.
//!
//! All functions in this module are pure and stateless: the result for one
//! payload never depends on an earlier one.
//!
//! The firmware has shipped several text formats.  [`decode_text`] tries them
//! in a fixed priority order and takes the first that parses:
//!
//! | Priority | Format | Example |
//! |---|---|---|
//! | 1 | Labelled, pipe-delimited | `BPM: 80 \| Cal:57.11 kcal \| Steps:  262` |
//! | 2 | Compact `KEY:value` pairs | `HR:75,CAL:120,STEPS:1500` |
//! | 3 | JSON object | `{"hr":75,"cal":120.5,"steps":1500}` |
//!
//! Empty or whitespace-only lines and battery-status lines are routine on the
//! wire and decode to [`Decoded::Ignored`], never to an error.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::trace;
use serde::Deserialize;

use crate::error::DecodeError;
use crate::protocol::BATTERY_MARKER;
use crate::types::Sample;

/// How the transport hands over notification values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
    /// Raw characteristic bytes carrying UTF-8 text (btleplug and most native
    /// stacks).  Invalid sequences are replaced, not rejected.
    #[default]
    Utf8,
    /// Base64 text wrapping the characteristic bytes, as delivered by bridges
    /// that cannot pass binary values.
    Base64,
}

/// Result of decoding one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Sample(Sample),
    /// A known non-data payload.
    Ignored,
}

// ── Text extraction ──────────────────────────────────────────────────────────

/// Turn a raw notification value into text according to `encoding`.
pub fn payload_text(raw: &[u8], encoding: PayloadEncoding) -> Result<String, DecodeError> {
    match encoding {
        PayloadEncoding::Utf8 => Ok(String::from_utf8_lossy(raw).into_owned()),
        PayloadEncoding::Base64 => {
            let text = String::from_utf8_lossy(raw);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(String::new());
            }
            let bytes = STANDARD
                .decode(trimmed)
                .map_err(|e| DecodeError::Base64(e.to_string()))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

/// Decode a raw notification value, stamping the result with `received_at`
/// (milliseconds since Unix epoch, local clock).
pub fn decode_payload(
    raw: &[u8],
    encoding: PayloadEncoding,
    received_at: f64,
) -> Result<Decoded, DecodeError> {
    let text = payload_text(raw, encoding)?;
    decode_text(&text, received_at)
}

/// Decode one line of payload text.
pub fn decode_text(text: &str, received_at: f64) -> Result<Decoded, DecodeError> {
    if is_non_data(text) {
        trace!("non-data payload {text:?}");
        return Ok(Decoded::Ignored);
    }

    if let Some(fields) = parse_labelled(text) {
        return Ok(fields.into_decoded(received_at));
    }
    if let Some(fields) = parse_key_values(text) {
        return Ok(fields.into_decoded(received_at));
    }
    if let Some(fields) = parse_json(text) {
        return Ok(fields.into_decoded(received_at));
    }

    let mut preview: String = text.trim().chars().take(64).collect();
    if preview.len() < text.trim().len() {
        preview.push('…');
    }
    Err(DecodeError::Unrecognized(preview))
}

/// Empty, whitespace/newline-only, or battery-status payloads.
pub fn is_non_data(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.is_empty() || trimmed.to_ascii_lowercase().contains(BATTERY_MARKER)
}

// ── Fields ───────────────────────────────────────────────────────────────────

/// The three readings, each possibly absent from a payload.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Fields {
    heart_rate: Option<u32>,
    calories: Option<f64>,
    step_count: Option<u64>,
}

impl Fields {
    fn is_empty(&self) -> bool {
        self.heart_rate.is_none() && self.calories.is_none() && self.step_count.is_none()
    }

    /// Absent fields default to zero; a payload with no fields at all is
    /// ignored.
    fn into_decoded(self, received_at: f64) -> Decoded {
        if self.is_empty() {
            return Decoded::Ignored;
        }
        Decoded::Sample(Sample {
            heart_rate: self.heart_rate.unwrap_or(0),
            calories: self.calories.unwrap_or(0.0),
            step_count: self.step_count.unwrap_or(0),
            timestamp: received_at,
        })
    }
}

// ── 1. Labelled format ───────────────────────────────────────────────────────

const FIELD_DELIMITER: char = '|';
const BPM_LABELS: &[&str] = &["BPM"];
const CAL_LABELS: &[&str] = &["Calories", "Cal"];
const STEPS_LABELS: &[&str] = &["Steps"];

/// `BPM: 80 | Cal:57.11 kcal | Steps:  262`
///
/// Returns `None` when the text carries neither the delimiter nor any label.
/// Each field is located by its label independently, so any subset may be
/// present; trailing units (`kcal`) are ignored.
fn parse_labelled(text: &str) -> Option<Fields> {
    let heart_rate = labelled_value(text, BPM_LABELS).and_then(leading_integer);
    let calories = labelled_value(text, CAL_LABELS).and_then(leading_decimal);
    let step_count = labelled_value(text, STEPS_LABELS).and_then(leading_integer);

    let has_label = [BPM_LABELS, CAL_LABELS, STEPS_LABELS]
        .iter()
        .any(|labels| labelled_value(text, labels).is_some());
    if !has_label && !text.contains(FIELD_DELIMITER) {
        return None;
    }
    Some(Fields {
        heart_rate,
        calories,
        step_count,
    })
}

/// Text following the first `"{label}:"` for any of `labels`, with leading
/// whitespace removed.
fn labelled_value<'a>(text: &'a str, labels: &[&str]) -> Option<&'a str> {
    labels.iter().find_map(|label| {
        let needle = format!("{label}:");
        text.find(&needle)
            .map(|at| text[at + needle.len()..].trim_start())
    })
}

fn leading_integer<T: std::str::FromStr>(text: &str) -> Option<T> {
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

fn leading_decimal(text: &str) -> Option<f64> {
    let int_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    if int_end == 0 {
        return None;
    }
    let mut end = int_end;
    if let Some(frac) = text[int_end..].strip_prefix('.') {
        let frac_len = frac
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(frac.len());
        end += 1 + frac_len;
    }
    text[..end].trim_end_matches('.').parse().ok()
}

// ── 2. Compact key-value format ──────────────────────────────────────────────

/// `HR:75,CAL:120,STEPS:1500`
///
/// Every non-empty comma-separated segment must be `KEY:value` with an
/// alphabetic key; unknown keys are skipped and missing ones default to zero.
/// Returns `None` unless at least one known key carries a valid value.
fn parse_key_values(text: &str) -> Option<Fields> {
    let mut fields = Fields::default();
    for segment in text.trim().split(',').filter(|s| !s.trim().is_empty()) {
        let (key, value) = segment.split_once(':')?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        let value = value.trim();
        match key.to_ascii_uppercase().as_str() {
            "HR" | "BPM" | "HEARTRATE" => fields.heart_rate = Some(count(value)?),
            "CAL" | "CALS" | "KCAL" | "CALORIES" => fields.calories = Some(quantity(value)?),
            "STEPS" | "STEP" | "STEPCOUNT" => fields.step_count = Some(count(value)?),
            _ => trace!("skipping unknown key {key:?}"),
        }
    }
    (!fields.is_empty()).then_some(fields)
}

/// Non-negative integer; a finite non-negative decimal is truncated.
fn count<T: TryFrom<u64> + std::str::FromStr>(value: &str) -> Option<T> {
    value.parse::<T>().ok().or_else(|| {
        let v = quantity(value)?;
        T::try_from(v.trunc() as u64).ok()
    })
}

fn quantity(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}

// ── 3. JSON object ───────────────────────────────────────────────────────────

/// Accepts the short and the long spelling of each key; when both are present
/// the short one wins.
#[derive(Debug, Deserialize)]
struct JsonReading {
    hr: Option<f64>,
    #[serde(rename = "heartRate")]
    heart_rate: Option<f64>,
    cal: Option<f64>,
    calories: Option<f64>,
    steps: Option<f64>,
    #[serde(rename = "stepCount")]
    step_count: Option<f64>,
}

fn parse_json(text: &str) -> Option<Fields> {
    let text = text.trim();
    if !text.starts_with('{') {
        return None;
    }
    let reading: JsonReading = serde_json::from_str(text).ok()?;
    let non_negative = |v: Option<f64>| v.filter(|v| v.is_finite() && *v >= 0.0);
    let fields = Fields {
        heart_rate: non_negative(reading.hr.or(reading.heart_rate))
            .and_then(|v| u32::try_from(v.trunc() as u64).ok()),
        calories: non_negative(reading.cal.or(reading.calories)),
        step_count: non_negative(reading.steps.or(reading.step_count)).map(|v| v.trunc() as u64),
    };
    (!fields.is_empty()).then_some(fields)
}
