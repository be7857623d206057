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


//! Titon Controller - serial driver and adaptive humidity control for Titon
//! ventilation units.
//!
//! The library exposes the layers separately: [`serial`] and [`protocol`]
//! talk to the unit, [`device`] turns register sequences into fan levels, and
//! [`service`] runs the automatic controller on top.

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod history;
pub mod learning;
pub mod logger;
pub mod manual_override;
pub mod night_quiet;
pub mod protocol;
pub mod serial;
pub mod service;
pub mod status;
pub mod telemetry;

#[cfg(test)]
pub mod test_utils;

pub use error::{ControllerError, Result};
