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

//! Error taxonomy for the controller.
//!
//! Transport and protocol faults are retried by the command layer before they
//! surface here; sequence faults abort a level transition; configuration and
//! telemetry faults degrade to defaults or `None` at their call sites.

use std::io;
use std::path::PathBuf;

/// Result type alias using ControllerError
pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    // ============================================================================
    // Transport Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to open serial port {port}: {source}")]
    SerialOpen {
        port: String,
        source: serialport::Error,
    },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    // ============================================================================
    // Protocol Errors
    // ============================================================================
    #[error("No response from register {register}")]
    NoResponse { register: String },

    #[error("Register mismatch: sent {expected}, device echoed {received:?}")]
    RegisterMismatch { expected: String, received: String },

    #[error("Invalid register address {0} (must be 0-999)")]
    InvalidRegister(u16),

    // ============================================================================
    // Device State Machine Errors
    // ============================================================================
    #[error("Invalid fan level {0} (must be 1-4)")]
    InvalidLevel(u8),

    #[error("Sequence step '{step}' failed: {source}")]
    SequenceStep {
        step: &'static str,
        #[source]
        source: Box<ControllerError>,
    },

    #[error("Command rejected: {0}")]
    Rejected(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Failed to read file {path}: {source}")]
    FileRead { path: PathBuf, source: io::Error },

    #[error("Failed to write file {path}: {source}")]
    FileWrite { path: PathBuf, source: io::Error },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ============================================================================
    // Telemetry Errors
    // ============================================================================
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Telemetry unavailable for {entity}: {reason}")]
    Telemetry { entity: String, reason: String },
}

impl ControllerError {
    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a rejection error surfaced to manual callers
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Whether the command layer should retry the transaction that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::SerialOpen { .. }
                | Self::Serial(_)
                | Self::NoResponse { .. }
                | Self::RegisterMismatch { .. }
        )
    }
}
