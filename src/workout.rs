//! Per-workout figures derived from the headband's lifetime counters.
//!
//! The link manager forwards raw device counters untouched.  A workout
//! recorder that wants "calories burned this session" captures a
//! [`WorkoutBaseline`] from the first sample and subtracts it from every later
//! one.

use serde::Serialize;

use crate::types::Sample;

/// Counter values captured at the start of a workout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkoutBaseline {
    pub calories: f64,
    pub step_count: u64,
    pub started_at: f64,
}

/// One sample expressed relative to a [`WorkoutBaseline`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutDelta {
    pub heart_rate: u32,
    pub calories: f64,
    pub step_count: u64,
    /// Milliseconds since the baseline sample.
    pub elapsed_ms: f64,
}

impl WorkoutBaseline {
    pub fn capture(first: &Sample) -> Self {
        Self {
            calories: first.calories,
            step_count: first.step_count,
            started_at: first.timestamp,
        }
    }

    /// Deltas since the baseline, floored at zero.  The counters restart from
    /// zero when the headband reboots mid-workout.
    pub fn delta(&self, sample: &Sample) -> WorkoutDelta {
        WorkoutDelta {
            heart_rate: sample.heart_rate,
            calories: (sample.calories - self.calories).max(0.0),
            step_count: sample.step_count.saturating_sub(self.step_count),
            elapsed_ms: (sample.timestamp - self.started_at).max(0.0),
        }
    }
}

/// Running totals for one workout.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutSummary {
    pub samples: u64,
    /// Mean over samples with a non-zero heart rate.
    pub average_heart_rate: f64,
    pub max_heart_rate: u32,
    pub calories: f64,
    pub step_count: u64,
    pub duration_ms: f64,
    #[serde(skip)]
    baseline: Option<WorkoutBaseline>,
    #[serde(skip)]
    heart_rate_sum: u64,
    #[serde(skip)]
    heart_rate_samples: u64,
}

impl WorkoutSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the next sample.  The first one becomes the baseline.
    pub fn record(&mut self, sample: &Sample) -> WorkoutDelta {
        let baseline = *self
            .baseline
            .get_or_insert_with(|| WorkoutBaseline::capture(sample));
        let delta = baseline.delta(sample);

        self.samples += 1;
        if sample.heart_rate > 0 {
            self.heart_rate_sum += u64::from(sample.heart_rate);
            self.heart_rate_samples += 1;
            self.average_heart_rate = self.heart_rate_sum as f64 / self.heart_rate_samples as f64;
            self.max_heart_rate = self.max_heart_rate.max(sample.heart_rate);
        }
        self.calories = delta.calories;
        self.step_count = delta.step_count;
        self.duration_ms = delta.elapsed_ms;
        delta
    }

    pub fn baseline(&self) -> Option<&WorkoutBaseline> {
        self.baseline.as_ref()
    }
}
