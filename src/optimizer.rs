//! Optimizer contract. The numeric algorithm lives behind this trait.

use crate::client::{ClientConfig, ClientId};
use crate::error::ExternalDependencyError;
use crate::forecast::ForecastCurve;
use crate::telemetry::LiveTelemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Everything the optimizer sees for one client at one instant.
#[derive(Clone, Debug)]
pub struct OptimizationRequest {
    pub client_id: ClientId,
    pub config: Arc<ClientConfig>,
    pub telemetry: LiveTelemetry,
    pub forecast: Arc<ForecastCurve>,
    pub now: DateTime<Utc>,
    pub horizon_hours: u32,
    pub step_minutes: u32,
}

#[async_trait]
pub trait Optimizer: Send + Sync {
    /// Returns a routing decision in `[0, 1]`.
    async fn decide(&self, request: &OptimizationRequest) -> Result<f64, ExternalDependencyError>;
}
