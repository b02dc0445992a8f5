//! Closed-loop correction of an installation's global yield factor.
//!
//! Each optimize pass samples measured production against the current
//! forecast point; the correction task turns the accumulated window into a
//! bounded, rate-limited adjustment of `global_yield`.

use crate::telemetry::Reading;
use chrono::{DateTime, Utc};

/// Numeric bounds of the corrector. All ranges are inclusive.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrectionPolicy {
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub min_yield: f64,
    pub max_yield: f64,
    /// Largest relative change of the yield per cycle (0.1 = 10 %).
    pub max_step: f64,
    /// Cumulative forecast (Wh-equivalent) below which a cycle is skipped.
    pub min_forecast: f64,
}

impl Default for CorrectionPolicy {
    fn default() -> Self {
        Self {
            min_ratio: 0.5,
            max_ratio: 1.5,
            min_yield: 0.05,
            max_yield: 1.0,
            max_step: 0.10,
            min_forecast: 1.0,
        }
    }
}

/// Measured vs. forecast production accumulated since the last correction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EfficiencyWindow {
    pub measured: f64,
    pub forecast: f64,
    pub samples: u32,
    pub last_sample: Option<DateTime<Utc>>,
}

impl EfficiencyWindow {
    /// Adds one sample if `measured` is newer than the previous sample.
    pub fn sample(&mut self, measured: Reading, forecast: f64) -> bool {
        if self.last_sample.map_or(false, |ts| measured.timestamp <= ts) {
            return false;
        }
        if !measured.value.is_finite() || !forecast.is_finite() {
            return false;
        }
        self.measured += measured.value.max(0.0);
        self.forecast += forecast.max(0.0);
        self.samples += 1;
        self.last_sample = Some(measured.timestamp);
        true
    }

    /// Empties the window, keeping the last sample time so readings are not counted twice.
    pub fn reset(&mut self) {
        self.measured = 0.0;
        self.forecast = 0.0;
        self.samples = 0;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Correction {
    Skipped(SkipReason),
    Applied {
        /// Unclamped measured / forecast
        raw_ratio: f64,
        /// Ratio after clamping to the policy range
        ratio: f64,
        previous: f64,
        updated: f64,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    NoSamples,
    ForecastTooSmall(f64),
    InvalidYield(f64),
}

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Computes the next yield factor from `current` and the sampled window.
///
/// Steps: ratio clamped to `[min_ratio, max_ratio]`, target clamped to
/// `[min_yield, max_yield]`, then the move from `current` limited to
/// `max_step * current`.
pub fn compute_correction(
    current: f64,
    window: &EfficiencyWindow,
    policy: &CorrectionPolicy,
) -> Correction {
    if window.samples == 0 {
        return Correction::Skipped(SkipReason::NoSamples);
    }
    if !(current.is_finite() && current > 0.0) {
        return Correction::Skipped(SkipReason::InvalidYield(current));
    }
    if window.forecast < policy.min_forecast {
        return Correction::Skipped(SkipReason::ForecastTooSmall(window.forecast));
    }

    let raw_ratio = window.measured / window.forecast;
    let ratio = clamp(raw_ratio, policy.min_ratio, policy.max_ratio);
    let target = clamp(current * ratio, policy.min_yield, policy.max_yield);

    let max_delta = policy.max_step * current;
    let updated = current + clamp(target - current, -max_delta, max_delta);

    Correction::Applied {
        raw_ratio,
        ratio,
        previous: current,
        updated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn window(measured: f64, forecast: f64) -> EfficiencyWindow {
        EfficiencyWindow {
            measured,
            forecast,
            samples: 1,
            last_sample: Some(at(0)),
        }
    }

    #[test]
    fn test_sampling_ignores_repeated_reading() {
        let mut w = EfficiencyWindow::default();
        assert!(w.sample(Reading::new(500.0, at(10)), 600.0));
        assert!(!w.sample(Reading::new(500.0, at(10)), 600.0));
        assert!(!w.sample(Reading::new(450.0, at(5)), 600.0));
        assert!(w.sample(Reading::new(300.0, at(20)), 400.0));
        assert_eq!(w.samples, 2);
        assert_eq!(w.measured, 800.0);
        assert_eq!(w.forecast, 1000.0);

        w.reset();
        assert_eq!(w.samples, 0);
        assert!(!w.sample(Reading::new(1.0, at(20)), 1.0));
    }

    #[test]
    fn test_small_correction_applied_fully() {
        let policy = CorrectionPolicy::default();
        match compute_correction(0.8, &window(950.0, 1000.0), &policy) {
            Correction::Applied { ratio, updated, .. } => {
                assert!((ratio - 0.95).abs() < 1e-12);
                assert!((updated - 0.76).abs() < 1e-12);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_near_zero_forecast_skips() {
        let policy = CorrectionPolicy::default();
        assert_eq!(
            compute_correction(0.8, &window(900.0, 1e-9), &policy),
            Correction::Skipped(SkipReason::ForecastTooSmall(1e-9))
        );
        assert_eq!(
            compute_correction(0.8, &EfficiencyWindow::default(), &policy),
            Correction::Skipped(SkipReason::NoSamples)
        );
    }

    #[test]
    fn test_extreme_ratios_clamped_and_rate_limited() {
        let policy = CorrectionPolicy::default();
        let cases = [
            (0.8, 1e9, 1.0),
            (0.8, 0.0, 1000.0),
            (0.05, 0.0, 50.0),
            (1.0, 1e6, 2.0),
            (0.3, 3.0, 2.0),
            (0.5, 1.0, 1e6),
        ];
        for (current, measured, forecast) in cases {
            match compute_correction(current, &window(measured, forecast), &policy) {
                Correction::Applied { ratio, updated, .. } => {
                    assert!(ratio >= policy.min_ratio && ratio <= policy.max_ratio);
                    assert!(
                        (updated - current).abs() <= policy.max_step * current + 1e-12,
                        "step too large: {} -> {}",
                        current,
                        updated
                    );
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_target_respects_yield_bounds() {
        let policy = CorrectionPolicy {
            max_step: 1.0,
            ..CorrectionPolicy::default()
        };
        match compute_correction(0.9, &window(1500.0, 1000.0), &policy) {
            Correction::Applied { updated, .. } => {
                assert!((updated - policy.max_yield).abs() < 1e-12)
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
