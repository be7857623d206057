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


//! Quiet-hours cap on the requested fan level.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveTime;
use tracing::warn;

use crate::config::NightQuietSettings;
use crate::device::FanLevel;

/// Parse an `HH:MM` time of day.
pub fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// A `[start, end)` time-of-day window. `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietWindow {
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self { start: parse_time(start)?, end: parse_time(end)? })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Caps levels inside the quiet window and remembers whether the last
/// evaluation fell inside it.
#[derive(Debug, Default)]
pub struct NightQuietGuard {
    active: AtomicBool,
}

impl NightQuietGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn within_quiet_hours(cfg: &NightQuietSettings, now: NaiveTime) -> bool {
        if !cfg.enabled {
            return false;
        }
        match QuietWindow::parse(&cfg.start, &cfg.end) {
            Some(window) => window.contains(now),
            None => {
                warn!(start = %cfg.start, end = %cfg.end, "night quiet window is malformed, ignoring");
                false
            }
        }
    }

    /// Returns the effective level and whether it was lowered.
    pub fn enforce(&self, cfg: &NightQuietSettings, level: FanLevel, now: NaiveTime) -> (FanLevel, bool) {
        if Self::within_quiet_hours(cfg, now) {
            self.active.store(true, Ordering::Relaxed);
            let cap = FanLevel::try_from(cfg.max_level.clamp(1, 4)).unwrap_or(FanLevel::Two);
            let capped = level.min(cap);
            return (capped, capped != level);
        }
        self.active.store(false, Ordering::Relaxed);
        (level, false)
    }
}
