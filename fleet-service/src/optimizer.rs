//! Built-in surplus-following optimizer.
//!
//! Rules, first match wins:
//! 1. Below the minimum temperature: full power
//! 2. Inside a forbidden slot: off
//! 3. Off-peak slot and below the next planned target: full power
//! 4. Otherwise route the forecast surplus over background load, as a
//!    fraction of heater power (rounded to on/off without gradation)
//!
//! Slot and planning times are compared against UTC wall time.

use async_trait::async_trait;
use optimasol::optimizer::{OptimizationRequest, Optimizer};
use optimasol::ExternalDependencyError;

#[derive(Debug, Default, Clone, Copy)]
pub struct SurplusOptimizer;

impl SurplusOptimizer {
    pub fn new() -> Self {
        Self
    }

    pub fn decide_now(&self, request: &OptimizationRequest) -> Result<f64, ExternalDependencyError> {
        let engine = &request.config.engine;
        let temperature = request
            .telemetry
            .temperature
            .ok_or_else(|| {
                ExternalDependencyError::Optimization("no temperature reading".to_string())
            })?
            .value;
        let now = request.now.naive_utc();
        let time = now.time();

        if temperature < engine.min_temp() {
            return Ok(1.0);
        }
        if engine.constraints.is_forbidden(time) {
            return Ok(0.0);
        }

        let next_target = engine
            .planning
            .iter()
            .filter_map(|entry| entry.next_after(now).map(|at| (at, entry.target_temp)))
            .min_by_key(|(at, _)| *at)
            .map(|(_, target)| target);
        if engine.prices.is_off_peak(time) && next_target.map_or(false, |t| temperature < t) {
            return Ok(1.0);
        }

        let power = engine.water_heater.power;
        if !(power > 0.0) {
            return Err(ExternalDependencyError::Optimization(format!(
                "invalid heater power {}",
                power
            )));
        }
        let production = request
            .forecast
            .nearest(request.now)
            .map_or(0.0, |point| point.production);
        let ratio = ((production - engine.background_noise()) / power).clamp(0.0, 1.0);

        if engine.gradation() {
            Ok(ratio)
        } else {
            Ok(if ratio >= 0.5 { 1.0 } else { 0.0 })
        }
    }
}

#[async_trait]
impl Optimizer for SurplusOptimizer {
    async fn decide(&self, request: &OptimizationRequest) -> Result<f64, ExternalDependencyError> {
        self.decide_now(request)
    }
}
