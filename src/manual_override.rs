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

//! Timed suppression of automatic control after a manual command.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;

use crate::logger::{EventLog, LogKind};

/// Suppresses automatic control for a while after a manual command.
pub struct ManualOverride {
    until: Mutex<Option<DateTime<Utc>>>,
    log: Arc<EventLog>,
}

impl ManualOverride {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { until: Mutex::new(None), log }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        *self.until.lock()
    }

    pub fn schedule(&self, minutes: u32) -> DateTime<Utc> {
        self.schedule_at(minutes, Utc::now())
    }

    /// Set the expiry to `now + minutes` (at least one minute).
    pub fn schedule_at(&self, minutes: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let minutes = minutes.max(1);
        let expiry = now + Duration::minutes(i64::from(minutes));
        *self.until.lock() = Some(expiry);
        self.log.append(
            LogKind::Mode,
            format!("Manual override active for {} min", minutes),
            json!({ "until": expiry }),
        );
        expiry
    }

    pub fn is_active(&self) -> (bool, Option<f64>) {
        self.is_active_at(Utc::now())
    }

    /// `(true, seconds_left)` while the window is open. The first call after
    /// it closes clears the expiry and logs the transition.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> (bool, Option<f64>) {
        let expired = {
            let mut until = self.until.lock();
            match *until {
                Some(expiry) if expiry > now => {
                    let remaining = (expiry - now).num_milliseconds() as f64 / 1000.0;
                    return (true, Some(remaining));
                }
                Some(_) => {
                    *until = None;
                    true
                }
                None => false,
            }
        };
        if expired {
            self.log.log(LogKind::Mode, "Manual override window expired; auto mode resumes");
        }
        (false, None)
    }
}
