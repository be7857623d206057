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


// Rolling history of telemetry samples.
//
// One sample per telemetry poll. 1440 samples cover a day at the fastest
// one-minute cadence; older samples are evicted first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::FanLevel;

pub const HISTORY_CAPACITY: usize = 1440;
pub const DEFAULT_HISTORY_LIMIT: usize = 288;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub ts: DateTime<Utc>,
    pub level: Option<FanLevel>,
    pub avg_humidity: Option<f64>,
    pub max_humidity: Option<f64>,
    pub avg_delta: Option<f64>,
    pub max_delta: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct History {
    samples: VecDeque<HistorySample>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { samples: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, sample: HistorySample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The newest `limit` samples, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<HistorySample> {
        let skip = self.samples.len().saturating_sub(limit);
        self.samples.iter().skip(skip).cloned().collect()
    }

    /// Percentage of samples with a known `max_delta` at or below zero,
    /// rounded to one decimal. `None` when no sample has a delta.
    pub fn time_in_range_pct(&self) -> Option<f64> {
        let (within, total) = self
            .samples
            .iter()
            .filter_map(|s| s.max_delta)
            .fold((0usize, 0usize), |(w, t), d| (w + usize::from(d <= 0.0), t + 1));
        if total == 0 {
            return None;
        }
        let pct = within as f64 / total as f64 * 100.0;
        Some((pct * 10.0).round() / 10.0)
    }
}
