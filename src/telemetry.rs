/*
 * This file is part of Titon Controller.
 *
 * Copyright (C) 2025 Titon Controller contributors
 *
 * Titon Controller is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Titon Controller is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Titon Controller. If not, see <https://www.gnu.org/licenses/>.
 */


//! Humidity telemetry: where readings come from and what is derived from them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{SensorEntity, Settings, SharedSettings};
use crate::error::{ControllerError, Result};
use crate::learning::LearningState;
use crate::logger::{EventLog, LogKind};

/// Resolves a sensor identifier to its current relative humidity.
///
/// Implementations must not fail: unknown or unavailable sensors read as `None`.
#[cfg_attr(test, mockall::automock)]
pub trait HumiditySource: Send + Sync {
    fn humidity(&self, entity_id: &str) -> Option<f64>;

    /// `false` when the source cannot produce anything at all, in which case
    /// a poll yields an empty map rather than a map of `None`s.
    fn is_available(&self) -> bool {
        true
    }
}

/// Source used when nothing is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSource;

impl HumiditySource for NullSource {
    fn humidity(&self, _entity_id: &str) -> Option<f64> {
        None
    }

    fn is_available(&self) -> bool {
        false
    }
}

impl<F> HumiditySource for F
where
    F: Fn(&str) -> Option<f64> + Send + Sync,
{
    fn humidity(&self, entity_id: &str) -> Option<f64> {
        self(entity_id)
    }
}

/// Poll every configured sensor once.
pub fn fetch_humidity(source: &dyn HumiditySource, sensors: &[SensorEntity]) -> BTreeMap<String, Option<f64>> {
    if !source.is_available() {
        return BTreeMap::new();
    }
    sensors
        .iter()
        .map(|s| (s.entity_id.clone(), source.humidity(&s.entity_id).filter(|v| v.is_finite())))
        .collect()
}

// ----------------------------------------------------------------------------
// Home Assistant REST fallback
// ----------------------------------------------------------------------------

#[derive(Deserialize)]
struct EntityState {
    #[serde(default)]
    state: Value,
}

/// Reads `sensor.*` states from the Home Assistant REST API using the
/// connection details in the live settings.
pub struct HomeAssistantSource {
    client: reqwest::blocking::Client,
    settings: SharedSettings,
    log: Arc<EventLog>,
}

impl HomeAssistantSource {
    pub fn new(settings: SharedSettings, log: Arc<EventLog>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, settings, log }
    }

    fn endpoint(&self) -> Option<(String, String, Duration)> {
        let settings = self.settings.lock();
        let url = settings.ha.url.trim().trim_end_matches('/').to_string();
        let token = settings.ha.token.trim().to_string();
        if url.is_empty() || token.is_empty() {
            return None;
        }
        Some((url, token, Duration::from_secs(settings.ha.timeout.max(1))))
    }

    pub fn fetch_state(&self, entity_id: &str) -> Result<Option<f64>> {
        let (url, token, timeout) = self
            .endpoint()
            .ok_or_else(|| ControllerError::invalid_config("ha", "url or token not set"))?;

        let resp = self
            .client
            .get(format!("{}/api/states/{}", url, entity_id))
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(ControllerError::Telemetry {
                entity: entity_id.to_string(),
                reason: format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>()),
            });
        }

        let payload: EntityState = resp.json()?;
        parse_state(entity_id, &payload.state)
    }
}

fn parse_state(entity_id: &str, state: &Value) -> Result<Option<f64>> {
    match state {
        Value::Null => Ok(None),
        Value::String(s) if s == "unknown" || s == "unavailable" => Ok(None),
        Value::String(s) => s.trim().parse::<f64>().map(Some).map_err(|_| ControllerError::Telemetry {
            entity: entity_id.to_string(),
            reason: format!("non-numeric state {:?}", s),
        }),
        Value::Number(n) => Ok(n.as_f64()),
        other => Err(ControllerError::Telemetry {
            entity: entity_id.to_string(),
            reason: format!("unexpected state {}", other),
        }),
    }
}

impl HumiditySource for HomeAssistantSource {
    fn humidity(&self, entity_id: &str) -> Option<f64> {
        match self.fetch_state(entity_id) {
            Ok(value) => value,
            Err(e) => {
                self.log.append(
                    LogKind::Error,
                    "HA state fetch failed",
                    json!({ "entity": entity_id, "error": e.to_string() }),
                );
                None
            }
        }
    }

    fn is_available(&self) -> bool {
        self.endpoint().is_some()
    }
}

// ----------------------------------------------------------------------------
// Metrics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub avg_humidity: Option<f64>,
    pub max_humidity: Option<f64>,
    pub avg_delta: Option<f64>,
    pub max_delta: Option<f64>,
    pub time_in_range_pct: Option<f64>,
}

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

/// Summarise a humidity poll against targets plus learned offsets.
/// `time_in_range_pct` is left for the history ring to fill in.
pub fn compute_metrics(
    humidity: &BTreeMap<String, Option<f64>>,
    settings: &Settings,
    learning: &LearningState,
) -> Metrics {
    let readings: Vec<(&String, f64)> = humidity
        .iter()
        .filter_map(|(id, v)| v.map(|v| (id, v)))
        .collect();
    if readings.is_empty() {
        return Metrics::default();
    }

    let n = readings.len() as f64;
    let avg = readings.iter().map(|(_, v)| v).sum::<f64>() / n;
    let max = readings.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max);
    let deltas: Vec<f64> = readings
        .iter()
        .map(|(id, v)| v - (settings.target_for(id) + learning.offset(id)))
        .collect();
    let avg_delta = deltas.iter().sum::<f64>() / n;
    let max_delta = deltas.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    debug!(avg, max, avg_delta, max_delta, "humidity metrics");

    Metrics {
        avg_humidity: Some(round_to(avg, 1)),
        max_humidity: Some(round_to(max, 1)),
        avg_delta: Some(round_to(avg_delta, 2)),
        max_delta: Some(round_to(max_delta, 2)),
        time_in_range_pct: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use parking_lot::Mutex;

    fn sensors() -> Vec<SensorEntity> {
        vec![SensorEntity::new("Bath", "sensor.bath"), SensorEntity::new("Bed", "sensor.bed")]
    }

    #[test]
    fn test_null_source_yields_empty_map() {
        assert!(fetch_humidity(&NullSource, &sensors()).is_empty());
    }

    #[test]
    fn test_closure_source() {
        let source = |id: &str| if id == "sensor.bath" { Some(61.5) } else { None };
        let map = fetch_humidity(&source, &sensors());
        assert_eq!(map.get("sensor.bath"), Some(&Some(61.5)));
        assert_eq!(map.get("sensor.bed"), Some(&None));
    }

    #[test]
    fn test_mock_source_queried_per_sensor() {
        let mut mock = MockHumiditySource::new();
        mock.expect_is_available().return_const(true);
        mock.expect_humidity().with(eq("sensor.bath")).times(1).return_const(Some(70.0));
        mock.expect_humidity().with(eq("sensor.bed")).times(1).return_const(Some(f64::NAN));

        let map = fetch_humidity(&mock, &sensors());
        assert_eq!(map["sensor.bath"], Some(70.0));
        assert_eq!(map["sensor.bed"], None);
    }

    #[test]
    fn test_unconfigured_home_assistant_is_unavailable() {
        let settings = Arc::new(Mutex::new(Settings::defaults(&sensors())));
        let log = Arc::new(EventLog::detached());
        let source = HomeAssistantSource::new(settings.clone(), log.clone());
        assert!(!source.is_available());
        assert!(fetch_humidity(&source, &sensors()).is_empty());

        settings.lock().ha.token = "secret".into();
        assert!(source.is_available());
        assert!(log.is_empty());
    }

    #[test]
    fn test_parse_state_values() {
        assert_eq!(parse_state("s", &json!("48.2")).unwrap(), Some(48.2));
        assert_eq!(parse_state("s", &json!(51)).unwrap(), Some(51.0));
        assert_eq!(parse_state("s", &json!("unavailable")).unwrap(), None);
        assert_eq!(parse_state("s", &json!("unknown")).unwrap(), None);
        assert_eq!(parse_state("s", &Value::Null).unwrap(), None);
        assert!(parse_state("s", &json!("wet")).is_err());
        assert!(parse_state("s", &json!([1])).is_err());
    }

    #[test]
    fn test_metrics_rounding_and_offsets() {
        let settings = Settings::defaults(&sensors());
        let mut learning = LearningState::default();
        let cfg = crate::config::LearningSettings { adapt_rate: 1.0, max_offset: 8.0, sample_window: 1 };
        learning.observe("sensor.bed", 2.0, &cfg);

        let humidity = BTreeMap::from([
            ("sensor.bath".to_string(), Some(60.04)),
            ("sensor.bed".to_string(), Some(50.0)),
            ("sensor.gone".to_string(), None),
        ]);
        let m = compute_metrics(&humidity, &settings, &learning);
        assert_eq!(m.avg_humidity, Some(55.0));
        assert_eq!(m.max_humidity, Some(60.0));
        // bath: 60.04 - 55 = 5.04, bed: 50 - 57 = -7.0
        assert_eq!(m.max_delta, Some(5.04));
        assert_eq!(m.avg_delta, Some(-0.98));
        assert_eq!(m.time_in_range_pct, None);
    }

    #[test]
    fn test_metrics_empty() {
        let settings = Settings::defaults(&sensors());
        let m = compute_metrics(&BTreeMap::new(), &settings, &LearningState::default());
        assert_eq!(m, Metrics::default());
    }
}
