//! Open-Meteo forecast provider.
//!
//! One request per panel for the global tilted irradiance (W/m²) on the
//! panel's plane. Production per panel is `GTI × surface × global_yield`,
//! capped at the panel's nominal power, then summed across panels.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use optimasol::client::{Installation, Panel, Position};
use optimasol::forecast::{ForecastCurve, ForecastPoint, ForecastProvider, ForecastWindow};
use optimasol::ExternalDependencyError;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

pub const BASE_URL: &str = "https://api.open-meteo.com";

const HOUR_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    hourly: Hourly,
}

#[derive(Debug, Deserialize)]
struct Hourly {
    time: Vec<String>,
    global_tilted_irradiance: Vec<Option<f64>>,
}

pub struct OpenMeteoProvider {
    http_client: Client,
    base_url: String,
}

impl OpenMeteoProvider {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        Self::with_base_url(BASE_URL, request_timeout)
    }

    /// Provider against a custom base URL (for testing with a mock server).
    pub fn with_base_url(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent("optimasol-fleet/0.1")
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http_client,
            base_url: base_url.into(),
        })
    }

    async fn fetch_panel(
        &self,
        position: &Position,
        panel: &Panel,
        window: ForecastWindow,
    ) -> Result<Hourly, ExternalDependencyError> {
        let url = format!("{}/v1/forecast", self.base_url);
        let query = [
            ("latitude", position.latitude.to_string()),
            ("longitude", position.longitude.to_string()),
            ("elevation", position.altitude.to_string()),
            ("hourly", "global_tilted_irradiance".to_string()),
            ("tilt", panel.tilt.to_string()),
            ("azimuth", open_meteo_azimuth(panel.azimuth).to_string()),
            ("timezone", "UTC".to_string()),
            ("start_hour", window.start.format("%Y-%m-%dT%H:00").to_string()),
            ("end_hour", window.end.format("%Y-%m-%dT%H:00").to_string()),
        ];

        let response = self
            .http_client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExternalDependencyError::ForecastUnavailable(format!(
                "Open-Meteo returned {}",
                status
            )));
        }
        let body: ForecastResponse = response.json().await.map_err(unavailable)?;
        Ok(body.hourly)
    }
}

fn unavailable(e: reqwest::Error) -> ExternalDependencyError {
    ExternalDependencyError::ForecastUnavailable(e.to_string())
}

/// Compass azimuth (180 = south) to Open-Meteo's (0 = south, -90 = east).
pub fn open_meteo_azimuth(compass: f64) -> f64 {
    compass - 180.0
}

/// Irradiance at standard test conditions, W/m²
const STC_IRRADIANCE: f64 = 1000.0;

/// Output of one panel. Without a surface the nominal power is scaled by
/// irradiance relative to standard test conditions.
fn panel_output(gti: f64, panel: &Panel, global_yield: f64) -> f64 {
    let gti = gti.max(0.0);
    let raw = match (panel.surface, panel.nominal_power) {
        (Some(surface), _) => gti * surface * global_yield,
        (None, Some(peak)) => gti / STC_IRRADIANCE * peak * global_yield,
        (None, None) => 0.0,
    };
    match panel.nominal_power {
        Some(cap) => raw.min(cap),
        None => raw,
    }
}

fn parse_hour(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, HOUR_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[async_trait]
impl ForecastProvider for OpenMeteoProvider {
    async fn fetch(
        &self,
        position: &Position,
        installation: &Installation,
        window: ForecastWindow,
    ) -> Result<ForecastCurve, ExternalDependencyError> {
        let mut totals: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();

        for panel in &installation.panels {
            let hourly = self.fetch_panel(position, panel, window).await?;
            for (raw, gti) in hourly.time.iter().zip(&hourly.global_tilted_irradiance) {
                let (Some(at), Some(gti)) = (parse_hour(raw), gti) else {
                    continue;
                };
                *totals.entry(at).or_insert(0.0) +=
                    panel_output(*gti, panel, installation.global_yield);
            }
        }

        if totals.is_empty() {
            return Err(ExternalDependencyError::ForecastUnavailable(
                "Open-Meteo returned no irradiance data".to_string(),
            ));
        }
        debug!(
            points = totals.len(),
            panels = installation.panels.len(),
            "Forecast fetched"
        );
        Ok(ForecastCurve::new(
            totals
                .into_iter()
                .map(|(timestamp, production)| ForecastPoint {
                    timestamp,
                    production,
                })
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn position() -> Position {
        serde_json::from_value(serde_json::json!({"latitude": 45.5, "longitude": 4.8, "altitude": 200.0}))
            .unwrap()
    }

    fn installation(panels: serde_json::Value) -> Installation {
        serde_json::from_value(serde_json::json!({"global_yield": 0.8, "panels": panels})).unwrap()
    }

    fn window() -> ForecastWindow {
        ForecastWindow::starting_at(Utc.with_ymd_and_hms(2024, 6, 21, 10, 0, 0).unwrap(), 24)
    }

    fn provider(server: &Server) -> OpenMeteoProvider {
        OpenMeteoProvider::with_base_url(server.url(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_panel_without_surface_uses_peak_power() {
        let panel: Panel =
            serde_json::from_value(serde_json::json!({"azimuth": 180.0, "tilt": 30.0, "nominal_power": 400.0}))
                .unwrap();
        assert!((panel_output(500.0, &panel, 0.8) - 160.0).abs() < 1e-9);
        assert_eq!(panel_output(-3.0, &panel, 0.8), 0.0);
    }

    #[test]
    fn test_azimuth_conversion() {
        assert_eq!(open_meteo_azimuth(180.0), 0.0);
        assert_eq!(open_meteo_azimuth(90.0), -90.0);
        assert_eq!(open_meteo_azimuth(270.0), 90.0);
    }

    #[tokio::test]
    async fn test_production_from_irradiance() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/forecast")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("hourly".into(), "global_tilted_irradiance".into()),
                Matcher::UrlEncoded("tilt".into(), "30".into()),
                Matcher::UrlEncoded("azimuth".into(), "0".into()),
                Matcher::UrlEncoded("start_hour".into(), "2024-06-21T10:00".into()),
                Matcher::UrlEncoded("end_hour".into(), "2024-06-22T10:00".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"hourly": {
                    "time": ["2024-06-21T10:00", "2024-06-21T11:00", "2024-06-21T12:00"],
                    "global_tilted_irradiance": [500.0, null, 900.0]
                }}"#,
            )
            .create_async()
            .await;

        let curve = provider(&server)
            .fetch(
                &position(),
                &installation(serde_json::json!([
                    {"azimuth": 180.0, "tilt": 30.0, "surface": 2.0, "nominal_power": 1000.0}
                ])),
                window(),
            )
            .await
            .unwrap();

        let points = curve.points();
        assert_eq!(points.len(), 2);
        // 500 W/m² x 2 m² x 0.8
        assert!((points[0].production - 800.0).abs() < 1e-9);
        // 1440 W capped at nominal power
        assert!((points[1].production - 1000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_panels_summed() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/forecast")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"hourly": {"time": ["2024-06-21T10:00"], "global_tilted_irradiance": [100.0]}}"#)
            .expect(2)
            .create_async()
            .await;

        let curve = provider(&server)
            .fetch(
                &position(),
                &installation(serde_json::json!([
                    {"azimuth": 90.0, "tilt": 20.0, "surface": 1.0},
                    {"azimuth": 270.0, "tilt": 20.0, "surface": 1.0}
                ])),
                window(),
            )
            .await
            .unwrap();

        assert_eq!(curve.len(), 1);
        assert!((curve.points()[0].production - 160.0).abs() < 1e-9);
        _mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upstream_error_reported() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/v1/forecast")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let result = provider(&server)
            .fetch(
                &position(),
                &installation(serde_json::json!([{"azimuth": 180.0, "tilt": 30.0, "surface": 2.0}])),
                window(),
            )
            .await;
        assert!(matches!(
            result,
            Err(ExternalDependencyError::ForecastUnavailable(msg)) if msg.contains("503")
        ));
    }
}
