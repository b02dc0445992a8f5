use super::config::{
    parse_hhmm, DriverConfig, EngineConfig, Installation, PriceMode, PriceModel, TimeSlot,
    WeatherConfig,
};
use crate::error::ConfigurationError;

const PROFILE_DAYS: usize = 7;
const PROFILE_HOURS: usize = 24;

/// Validates the engine section.
///
/// Rules:
/// - Heater volume and power strictly positive
/// - Price fields match the mode (flat price XOR peak/off-peak pair)
/// - HPHC requires at least one off-peak slot
/// - Every slot is `HH:MM` with start < end
/// - Planning day codes resolve to a weekday, times are `HH:MM`
/// - Consumption profile, when present, is 7 x 24
pub fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigurationError> {
    let heater = &engine.water_heater;
    if !(heater.volume > 0.0) {
        return Err(ConfigurationError::invalid(
            "engine.water_heater.volume",
            "must be positive",
        ));
    }
    if !(heater.power > 0.0) {
        return Err(ConfigurationError::invalid(
            "engine.water_heater.power",
            "must be positive",
        ));
    }
    if !heater.insulation_coeff.is_finite() || heater.insulation_coeff < 0.0 {
        return Err(ConfigurationError::invalid(
            "engine.water_heater.insulation_coeff",
            "must be a non-negative number",
        ));
    }

    validate_prices(&engine.prices)?;

    for (i, slot) in engine.constraints.forbidden_slots.iter().enumerate() {
        validate_slot(slot, &format!("engine.constraints.forbidden_slots[{}]", i))?;
    }

    if let Some(profile) = &engine.constraints.consumption_profile {
        if profile.len() != PROFILE_DAYS || profile.iter().any(|day| day.len() != PROFILE_HOURS) {
            return Err(ConfigurationError::invalid(
                "engine.constraints.consumption_profile",
                "must hold 7 rows of 24 hourly values",
            ));
        }
    }

    for (i, entry) in engine.planning.iter().enumerate() {
        if entry.day.weekday().is_none() {
            return Err(ConfigurationError::invalid(
                format!("engine.planning[{}].day", i),
                "unknown day code",
            ));
        }
        if parse_hhmm(&entry.time).is_none() {
            return Err(ConfigurationError::invalid(
                format!("engine.planning[{}].time", i),
                format!("expected HH:MM, got '{}'", entry.time),
            ));
        }
        if entry.volume < 0.0 {
            return Err(ConfigurationError::invalid(
                format!("engine.planning[{}].volume", i),
                "must not be negative",
            ));
        }
    }

    Ok(())
}

fn validate_prices(prices: &PriceModel) -> Result<(), ConfigurationError> {
    match prices.mode {
        PriceMode::Base => {
            if prices.base_price.is_none() {
                return Err(ConfigurationError::missing("engine.prices.base_price"));
            }
            if prices.hp_price.is_some() || prices.hc_price.is_some() {
                return Err(ConfigurationError::invalid(
                    "engine.prices",
                    "hp_price/hc_price are not allowed in BASE mode",
                ));
            }
            if !prices.hc_slots.is_empty() {
                return Err(ConfigurationError::invalid(
                    "engine.prices.hc_slots",
                    "not allowed in BASE mode",
                ));
            }
        }
        PriceMode::PeakOffPeak => {
            if prices.hp_price.is_none() {
                return Err(ConfigurationError::missing("engine.prices.hp_price"));
            }
            if prices.hc_price.is_none() {
                return Err(ConfigurationError::missing("engine.prices.hc_price"));
            }
            if prices.base_price.is_some() {
                return Err(ConfigurationError::invalid(
                    "engine.prices.base_price",
                    "not allowed in HPHC mode",
                ));
            }
            if prices.hc_slots.is_empty() {
                return Err(ConfigurationError::missing("engine.prices.hc_slots"));
            }
            for (i, slot) in prices.hc_slots.iter().enumerate() {
                validate_slot(slot, &format!("engine.prices.hc_slots[{}]", i))?;
            }
        }
    }
    Ok(())
}

fn validate_slot(slot: &TimeSlot, field: &str) -> Result<(), ConfigurationError> {
    match slot.bounds() {
        None => Err(ConfigurationError::invalid(
            field,
            format!("expected HH:MM bounds, got '{}'-'{}'", slot.start, slot.end),
        )),
        Some((start, end)) if start >= end => {
            Err(ConfigurationError::invalid(field, "start must be before end"))
        }
        Some(_) => Ok(()),
    }
}

/// Validates the weather section: exactly one of an own installation or a reference.
pub fn validate_weather(weather: &WeatherConfig) -> Result<(), ConfigurationError> {
    if weather.weather_ref.is_some() {
        if weather.installation.is_some() || weather.position.is_some() {
            return Err(ConfigurationError::invalid(
                "weather",
                "weather_ref excludes position and installation",
            ));
        }
        return Ok(());
    }

    let installation = weather
        .installation
        .as_ref()
        .ok_or_else(|| ConfigurationError::missing("weather.installation"))?;
    let position = weather
        .position
        .as_ref()
        .ok_or_else(|| ConfigurationError::missing("weather.position"))?;
    if !(-90.0..=90.0).contains(&position.latitude) {
        return Err(ConfigurationError::invalid(
            "weather.position.latitude",
            "must be within [-90, 90]",
        ));
    }
    if !(-180.0..=180.0).contains(&position.longitude) {
        return Err(ConfigurationError::invalid(
            "weather.position.longitude",
            "must be within [-180, 180]",
        ));
    }
    validate_installation(installation)
}

fn validate_installation(installation: &Installation) -> Result<(), ConfigurationError> {
    if !(installation.global_yield > 0.0 && installation.global_yield <= 1.0) {
        return Err(ConfigurationError::invalid(
            "weather.installation.global_yield",
            "must be within (0, 1]",
        ));
    }
    if installation.panels.is_empty() {
        return Err(ConfigurationError::missing("weather.installation.panels"));
    }
    for (i, panel) in installation.panels.iter().enumerate() {
        if !(0.0..=90.0).contains(&panel.tilt) {
            return Err(ConfigurationError::invalid(
                format!("weather.installation.panels[{}].tilt", i),
                "must be within [0, 90]",
            ));
        }
        if !(0.0..=360.0).contains(&panel.azimuth) {
            return Err(ConfigurationError::invalid(
                format!("weather.installation.panels[{}].azimuth", i),
                "must be within [0, 360]",
            ));
        }
        if panel.surface.map_or(false, |s| !(s > 0.0)) {
            return Err(ConfigurationError::invalid(
                format!("weather.installation.panels[{}].surface", i),
                "must be positive",
            ));
        }
    }
    Ok(())
}

pub fn validate_driver(driver: &DriverConfig) -> Result<(), ConfigurationError> {
    if driver.type_id.trim().is_empty() {
        return Err(ConfigurationError::missing("driver.type"));
    }
    Ok(())
}
