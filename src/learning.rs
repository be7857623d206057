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


//! Per-sensor target offsets learned from recent humidity deltas.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::LearningSettings;

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[derive(Debug, Clone, Default)]
pub struct LearningState {
    offsets: BTreeMap<String, f64>,
    buffers: HashMap<String, VecDeque<f64>>,
    last_update: Option<DateTime<Utc>>,
}

impl LearningState {
    /// Start every listed sensor at a zero offset.
    pub fn new<'a>(sensor_ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            offsets: sensor_ids.into_iter().map(|id| (id.to_string(), 0.0)).collect(),
            ..Self::default()
        }
    }

    pub fn offset(&self, sensor_id: &str) -> f64 {
        self.offsets.get(sensor_id).copied().unwrap_or(0.0)
    }

    pub fn offsets(&self) -> &BTreeMap<String, f64> {
        &self.offsets
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Number of buffered deltas for a sensor.
    pub fn buffered(&self, sensor_id: &str) -> usize {
        self.buffers.get(sensor_id).map_or(0, VecDeque::len)
    }

    /// Record a delta. Once the sensor's window is full, nudge its offset by
    /// `adapt_rate * mean(window)`, clamped to `±max_offset`. Returns whether
    /// the offset was updated.
    pub fn observe(&mut self, sensor_id: &str, delta: f64, cfg: &LearningSettings) -> bool {
        let window = cfg.sample_window.max(1);
        let buf = self.buffers.entry(sensor_id.to_string()).or_default();
        buf.push_back(delta);
        while buf.len() > window {
            buf.pop_front();
        }
        if buf.len() < window {
            return false;
        }

        let mean = buf.iter().sum::<f64>() / buf.len() as f64;
        let max_offset = cfg.max_offset.abs();
        let current = self.offset(sensor_id);
        let next = round3((current + cfg.adapt_rate * mean).clamp(-max_offset, max_offset));
        debug!(sensor = sensor_id, mean, offset = next, "learning offset updated");
        self.offsets.insert(sensor_id.to_string(), next);
        self.last_update = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(rate: f64, max: f64, window: usize) -> LearningSettings {
        LearningSettings { adapt_rate: rate, max_offset: max, sample_window: window }
    }

    #[test]
    fn test_no_update_until_window_full() {
        let mut state = LearningState::new(["s"]);
        let c = cfg(0.1, 8.0, 12);
        for _ in 0..11 {
            assert!(!state.observe("s", 2.0, &c));
        }
        assert_eq!(state.offset("s"), 0.0);
        assert!(state.last_update().is_none());
        assert!(state.observe("s", 2.0, &c));
        assert_eq!(state.offset("s"), 0.2);
        assert!(state.last_update().is_some());
    }

    #[test]
    fn test_offset_saturates_at_max() {
        let mut state = LearningState::new(["s"]);
        let c = cfg(0.1, 0.5, 12);
        for _ in 0..40 {
            state.observe("s", 2.0, &c);
        }
        assert_eq!(state.offset("s"), 0.5);
        state.observe("s", 2.0, &c);
        assert_eq!(state.offset("s"), 0.5);
    }

    #[test]
    fn test_negative_offsets_clamp() {
        let mut state = LearningState::default();
        let c = cfg(1.0, 3.0, 2);
        for _ in 0..5 {
            state.observe("dry", -10.0, &c);
        }
        assert_eq!(state.offset("dry"), -3.0);
    }

    #[test]
    fn test_window_shrink_drops_oldest() {
        let mut state = LearningState::default();
        let wide = cfg(0.1, 8.0, 6);
        for d in [9.0, 9.0, 9.0, 1.0] {
            state.observe("s", d, &wide);
        }
        assert_eq!(state.buffered("s"), 4);

        // Shrinking to 2 keeps only the last two samples: [1.0, 1.0].
        let narrow = cfg(0.1, 8.0, 2);
        assert!(state.observe("s", 1.0, &narrow));
        assert_eq!(state.buffered("s"), 2);
        assert_eq!(state.offset("s"), 0.1);
    }

    #[test]
    fn test_sensors_learn_independently() {
        let mut state = LearningState::new(["a", "b"]);
        let c = cfg(0.5, 8.0, 1);
        state.observe("a", 1.0, &c);
        assert_eq!(state.offset("a"), 0.5);
        assert_eq!(state.offset("b"), 0.0);
        assert_eq!(state.offsets().len(), 2);
    }
}
