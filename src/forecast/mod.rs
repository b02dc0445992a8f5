//! Production forecasts: curve type, provider contract and per-client state.

pub mod resolver;

pub use resolver::{distance_km, group_nearby, plan_forecasts, resolve_leader, ForecastPlan};

use crate::client::{ClientId, Installation, Position};
use crate::error::ExternalDependencyError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    /// Watts
    pub production: f64,
}

/// Production curve ordered by timestamp.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastCurve {
    points: Vec<ForecastPoint>,
}

impl ForecastCurve {
    /// Sorts points by timestamp; for duplicate timestamps the last one given wins.
    pub fn new(mut points: Vec<ForecastPoint>) -> Self {
        points.retain(|p| p.production.is_finite());
        points.sort_by_key(|p| p.timestamp);
        let mut deduped: Vec<ForecastPoint> = Vec::with_capacity(points.len());
        for point in points {
            match deduped.last_mut() {
                Some(last) if last.timestamp == point.timestamp => *last = point,
                _ => deduped.push(point),
            }
        }
        Self { points: deduped }
    }

    pub fn points(&self) -> &[ForecastPoint] {
        &self.points
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Point whose timestamp is closest to `at`; the earlier one on a tie.
    pub fn nearest(&self, at: DateTime<Utc>) -> Option<ForecastPoint> {
        let idx = self.points.partition_point(|p| p.timestamp < at);
        let after = self.points.get(idx);
        let before = idx.checked_sub(1).and_then(|i| self.points.get(i));
        match (before, after) {
            (Some(b), Some(a)) => {
                if at - b.timestamp <= a.timestamp - at {
                    Some(*b)
                } else {
                    Some(*a)
                }
            }
            (Some(p), None) | (None, Some(p)) => Some(*p),
            (None, None) => None,
        }
    }

    /// Same timestamps with every production multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> ForecastCurve {
        let points = self
            .points
            .iter()
            .map(|p| ForecastPoint {
                timestamp: p.timestamp,
                production: p.production * factor,
            })
            .collect();
        ForecastCurve::new(points)
    }

    /// Points within `[from, to)`.
    pub fn between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = &ForecastPoint> {
        self.points
            .iter()
            .filter(move |p| p.timestamp >= from && p.timestamp < to)
    }
}

/// Requested forecast horizon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForecastWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ForecastWindow {
    pub fn starting_at(start: DateTime<Utc>, horizon_hours: u32) -> Self {
        Self {
            start,
            end: start + Duration::hours(i64::from(horizon_hours)),
        }
    }
}

/// Turns a location and panel geometry into a production curve.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn fetch(
        &self,
        position: &Position,
        installation: &Installation,
        window: ForecastWindow,
    ) -> Result<ForecastCurve, ExternalDependencyError>;
}

/// Forecast held by one client. Followers hold the leader's curve by `Arc`.
#[derive(Clone, Debug, Default)]
pub struct ForecastState {
    pub curve: Option<Arc<ForecastCurve>>,
    /// Last refresh failed; `curve` is the last good one
    pub stale: bool,
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Leader the curve came from
    pub source: Option<ClientId>,
    pub last_error: Option<String>,
}

impl ForecastState {
    pub fn install(&mut self, curve: Arc<ForecastCurve>, source: ClientId, at: DateTime<Utc>) {
        self.curve = Some(curve);
        self.stale = false;
        self.refreshed_at = Some(at);
        self.source = Some(source);
        self.last_error = None;
    }

    /// Keeps the current curve and flags it stale.
    pub fn mark_stale(&mut self, error: &str) {
        self.stale = true;
        self.last_error = Some(error.to_string());
    }

    pub fn current_point(&self, at: DateTime<Utc>) -> Option<ForecastPoint> {
        self.curve.as_ref().and_then(|c| c.nearest(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 21, hour, min, 0).unwrap()
    }

    fn curve() -> ForecastCurve {
        ForecastCurve::new(vec![
            ForecastPoint { timestamp: at(12, 0), production: 1200.0 },
            ForecastPoint { timestamp: at(10, 0), production: 800.0 },
            ForecastPoint { timestamp: at(11, 0), production: 1000.0 },
        ])
    }

    #[test]
    fn test_points_sorted() {
        let c = curve();
        let ts: Vec<_> = c.points().iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![at(10, 0), at(11, 0), at(12, 0)]);
    }

    #[test]
    fn test_nearest_picks_closest() {
        let c = curve();
        assert_eq!(c.nearest(at(10, 20)).unwrap().production, 800.0);
        assert_eq!(c.nearest(at(10, 40)).unwrap().production, 1000.0);
        assert_eq!(c.nearest(at(10, 30)).unwrap().production, 800.0);
        assert_eq!(c.nearest(at(6, 0)).unwrap().production, 800.0);
        assert_eq!(c.nearest(at(23, 0)).unwrap().production, 1200.0);
        assert!(ForecastCurve::default().nearest(at(12, 0)).is_none());
    }

    #[test]
    fn test_duplicates_keep_last() {
        let c = ForecastCurve::new(vec![
            ForecastPoint { timestamp: at(9, 0), production: 1.0 },
            ForecastPoint { timestamp: at(9, 0), production: 2.0 },
            ForecastPoint { timestamp: at(9, 0), production: f64::NAN },
        ]);
        assert_eq!(c.len(), 1);
        assert_eq!(c.points()[0].production, 2.0);
    }

    #[test]
    fn test_scaled_keeps_timestamps() {
        let c = curve().scaled(0.9);
        assert_eq!(c.len(), 3);
        assert_eq!(c.points()[0].timestamp, at(10, 0));
        assert!((c.points()[2].production - 1080.0).abs() < 1e-9);
    }

    #[test]
    fn test_mark_stale_keeps_curve() {
        let mut state = ForecastState::default();
        state.install(Arc::new(curve()), ClientId(1), at(9, 0));
        state.mark_stale("timeout");
        assert!(state.stale);
        assert_eq!(state.curve.as_ref().unwrap().len(), 3);
        assert_eq!(state.current_point(at(12, 5)).unwrap().production, 1200.0);
    }
}
