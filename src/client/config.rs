//! Client configuration document.
//!
//! The on-disk / on-wire shape has three top-level sections, `engine`,
//! `weather` and `driver`. Optional fields are skipped when unset so that a
//! serialize/deserialize round trip yields an equal value.

use super::validation;
use super::ClientId;
use crate::error::ConfigurationError;
use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MIN_TEMP: f64 = 40.0;
pub const DEFAULT_BACKGROUND_NOISE: f64 = 0.0;
pub const DEFAULT_GRADATION: bool = true;

/// Complete configuration of one installation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub engine: EngineConfig,
    pub weather: WeatherConfig,
    pub driver: DriverConfig,
}

impl ClientConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigurationError> {
        let config: ClientConfig =
            serde_json::from_str(raw).map_err(|e| ConfigurationError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a configuration held as a JSON value.
    pub fn from_value(value: Value) -> Result<Self, ConfigurationError> {
        let config: ClientConfig = serde_json::from_value(value)
            .map_err(|e| ConfigurationError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Cross-field validation that does not depend on the owning client.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validation::validate_engine(&self.engine)?;
        validation::validate_weather(&self.weather)?;
        validation::validate_driver(&self.driver)
    }

    /// Full validation for a config owned by `owner`, rejecting self references.
    pub fn validate_for(&self, owner: ClientId) -> Result<(), ConfigurationError> {
        self.validate()?;
        if self.weather.weather_ref == Some(owner) {
            return Err(ConfigurationError::invalid(
                "weather.weather_ref",
                "a client cannot reference itself",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine section
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub water_heater: WaterHeater,
    pub prices: PriceModel,
    #[serde(default, skip_serializing_if = "Features::is_unset")]
    pub features: Features,
    #[serde(default, skip_serializing_if = "Constraints::is_unset")]
    pub constraints: Constraints,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planning: Vec<PlanningEntry>,
}

impl EngineConfig {
    pub fn min_temp(&self) -> f64 {
        self.constraints.min_temp.unwrap_or(DEFAULT_MIN_TEMP)
    }

    pub fn background_noise(&self) -> f64 {
        self.constraints
            .background_noise
            .unwrap_or(DEFAULT_BACKGROUND_NOISE)
    }

    pub fn gradation(&self) -> bool {
        self.features.gradation.unwrap_or(DEFAULT_GRADATION)
    }

    pub fn optimization_mode(&self) -> OptimizationMode {
        self.features.mode.unwrap_or_default()
    }
}

/// Physical parameters of the water heater.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaterHeater {
    /// Litres
    pub volume: f64,
    /// Watts
    pub power: f64,
    pub insulation_coeff: f64,
    /// °C
    pub temp_cold_water: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceMode {
    /// Flat tariff
    #[serde(rename = "BASE")]
    Base,
    /// Peak / off-peak tariff
    #[serde(rename = "HPHC")]
    PeakOffPeak,
}

/// Tariff. Which price fields are legal depends on `mode`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceModel {
    pub mode: PriceMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hp_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hc_price: Option<f64>,
    /// Off-peak windows, HPHC only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hc_slots: Vec<TimeSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resell_price: Option<f64>,
}

impl PriceModel {
    pub fn resell_price(&self) -> f64 {
        self.resell_price.unwrap_or(0.0)
    }

    /// True when `time` falls in an off-peak window.
    pub fn is_off_peak(&self, time: NaiveTime) -> bool {
        self.mode == PriceMode::PeakOffPeak && self.hc_slots.iter().any(|s| s.contains(time))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationMode {
    #[default]
    #[serde(rename = "cost")]
    Cost,
    #[serde(rename = "self_consumption", alias = "autoconso")]
    SelfConsumption,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<OptimizationMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradation: Option<bool>,
}

impl Features {
    fn is_unset(&self) -> bool {
        self.mode.is_none() && self.gradation.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_temp: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_slots: Vec<TimeSlot>,
    /// Household draw (W) that PV must cover before the heater sees surplus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_noise: Option<f64>,
    /// 7 days x 24 hourly hot-water draws.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumption_profile: Option<Vec<Vec<f64>>>,
}

impl Constraints {
    fn is_unset(&self) -> bool {
        self.min_temp.is_none()
            && self.forbidden_slots.is_empty()
            && self.background_noise.is_none()
            && self.consumption_profile.is_none()
    }

    pub fn is_forbidden(&self, time: NaiveTime) -> bool {
        self.forbidden_slots.iter().any(|s| s.contains(time))
    }
}

/// Daily time window, `HH:MM` bounds, start inclusive and end exclusive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: String,
    pub end: String,
}

impl TimeSlot {
    pub fn new(start: &str, end: &str) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    /// Parsed bounds, `None` if either side is not `HH:MM`.
    pub fn bounds(&self) -> Option<(NaiveTime, NaiveTime)> {
        Some((parse_hhmm(&self.start)?, parse_hhmm(&self.end)?))
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        match self.bounds() {
            Some((start, end)) => time >= start && time < end,
            None => false,
        }
    }
}

pub(crate) fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

/// Day of week as stored in planning entries: an index (0 = Monday) or a name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DayCode {
    Index(i64),
    Name(String),
}

impl DayCode {
    pub fn weekday(&self) -> Option<Weekday> {
        match self {
            DayCode::Index(i) => match i {
                0 => Some(Weekday::Mon),
                1 => Some(Weekday::Tue),
                2 => Some(Weekday::Wed),
                3 => Some(Weekday::Thu),
                4 => Some(Weekday::Fri),
                5 => Some(Weekday::Sat),
                6 => Some(Weekday::Sun),
                _ => None,
            },
            DayCode::Name(name) => match name.trim().to_lowercase().as_str() {
                "mon" | "monday" | "lundi" => Some(Weekday::Mon),
                "tue" | "tuesday" | "mardi" => Some(Weekday::Tue),
                "wed" | "wednesday" | "mercredi" => Some(Weekday::Wed),
                "thu" | "thursday" | "jeudi" => Some(Weekday::Thu),
                "fri" | "friday" | "vendredi" => Some(Weekday::Fri),
                "sat" | "saturday" | "samedi" => Some(Weekday::Sat),
                "sun" | "sunday" | "dimanche" => Some(Weekday::Sun),
                _ => None,
            },
        }
    }
}

/// Hot-water need: reach `target_temp` with `volume` litres at `time` on `day`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanningEntry {
    pub day: DayCode,
    pub time: String,
    pub target_temp: f64,
    pub volume: f64,
}

impl PlanningEntry {
    /// Next occurrence strictly after `now`, within the coming week.
    pub fn next_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let weekday = self.day.weekday()?;
        let time = parse_hhmm(&self.time)?;
        let ahead = (weekday.num_days_from_monday() + 7
            - now.weekday().num_days_from_monday())
            % 7;
        let candidate = (now.date() + chrono::Duration::days(i64::from(ahead))).and_time(time);
        if candidate > now {
            Some(candidate)
        } else {
            Some(candidate + chrono::Duration::days(7))
        }
    }
}

// ---------------------------------------------------------------------------
// Weather section
// ---------------------------------------------------------------------------

/// Either an installation of its own (leader) or a reference to a leader.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation: Option<Installation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather_ref: Option<ClientId>,
    /// Enables the periodic yield self-correction.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_correction: bool,
}

impl WeatherConfig {
    pub fn is_leader(&self) -> bool {
        self.weather_ref.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Installation {
    /// Global yield factor applied to the irradiance model, in (0, 1].
    #[serde(alias = "rendement_global")]
    pub global_yield: f64,
    #[serde(alias = "liste_panneaux")]
    pub panels: Vec<Panel>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    /// Compass degrees, 180 = south
    pub azimuth: f64,
    /// Degrees from horizontal
    pub tilt: f64,
    /// m²
    #[serde(default, alias = "surface_panneau", skip_serializing_if = "Option::is_none")]
    pub surface: Option<f64>,
    /// Peak watts
    #[serde(default, alias = "puissance_nominale", skip_serializing_if = "Option::is_none")]
    pub nominal_power: Option<f64>,
}

// ---------------------------------------------------------------------------
// Driver section
// ---------------------------------------------------------------------------

/// Driver binding: stable type id plus the driver's own serialized config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(rename = "type")]
    pub type_id: String,
    #[serde(default)]
    pub config: Value,
}
