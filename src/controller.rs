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


//! Humidity-driven level recommendation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{SensorEntity, Settings};
use crate::device::FanLevel;
use crate::learning::LearningState;

/// Threshold policy. Parsed case-insensitively; unknown names mean balanced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Aggressiveness {
    Calm,
    Aggressive,
    #[default]
    Balanced,
}

impl From<String> for Aggressiveness {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "calm" => Self::Calm,
            "aggressive" => Self::Aggressive,
            _ => Self::Balanced,
        }
    }
}

/// Delta thresholds in percentage points of relative humidity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Thresholds {
    pub fn for_policy(policy: Aggressiveness) -> Self {
        Self {
            high: if policy == Aggressiveness::Calm { 8.0 } else { 6.0 },
            medium: if policy == Aggressiveness::Calm { 4.0 } else { 3.0 },
            low: if policy == Aggressiveness::Aggressive { -3.0 } else { -1.5 },
        }
    }
}

impl From<Aggressiveness> for Thresholds {
    fn from(policy: Aggressiveness) -> Self {
        Self::for_policy(policy)
    }
}

/// Map the worst and mean delta to a level.
pub fn decide(max_delta: f64, avg_delta: f64, t: &Thresholds) -> FanLevel {
    if max_delta >= t.high {
        FanLevel::Four
    } else if max_delta >= t.medium || avg_delta >= t.medium / 2.0 {
        FanLevel::Three
    } else if avg_delta <= t.low {
        FanLevel::One
    } else {
        FanLevel::Two
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub level: FanLevel,
    pub reason: String,
}

/// Compute per-sensor deltas against `target + offset`, feed each into the
/// learning buffers, then pick a level.
///
/// Sensors without a reading are skipped. With no usable data the
/// recommendation holds level 2.
pub fn evaluate(
    humidity: &BTreeMap<String, Option<f64>>,
    sensors: &[SensorEntity],
    settings: &Settings,
    learning: &mut LearningState,
) -> Recommendation {
    if humidity.is_empty() {
        return Recommendation {
            level: FanLevel::Two,
            reason: "No humidity data - staying at Level 2".to_string(),
        };
    }

    let mut deltas = Vec::with_capacity(sensors.len());
    for sensor in sensors {
        let Some(value) = humidity.get(&sensor.entity_id).copied().flatten() else {
            continue;
        };
        let delta = value - (settings.target_for(&sensor.entity_id) + learning.offset(&sensor.entity_id));
        learning.observe(&sensor.entity_id, delta, &settings.learning);
        deltas.push(delta);
    }

    if deltas.is_empty() {
        return Recommendation {
            level: FanLevel::Two,
            reason: "No valid humidity readings - holding Level 2".to_string(),
        };
    }

    let max_delta = deltas.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg_delta = deltas.iter().sum::<f64>() / deltas.len() as f64;
    let thresholds = Thresholds::from(settings.auto_mode.aggressiveness);

    Recommendation {
        level: decide(max_delta, avg_delta, &thresholds),
        reason: format!("avgΔ {:.1}%, maxΔ {:.1}%", avg_delta, max_delta),
    }
}

/// Outcome of the most recent automatic-control tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub recommended_level: Option<FanLevel>,
    /// `0` means the controller turned the unit off.
    pub applied_level: Option<u8>,
    pub reason: Option<String>,
    pub last_learning_update: Option<DateTime<Utc>>,
}
