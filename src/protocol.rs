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

//! Register command protocol.
//!
//! Writes are `"{addr:03}0+{value:05}\r\n"` and must be echoed back with the
//! same leading register. Reads are `"{addr:03}1xxxxxx\r\n"`.

use std::fmt;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::device::SharedState;
use crate::error::{ControllerError, Result};
use crate::logger::{EventLog, LogKind};
use crate::serial::Transport;

/// Total attempts per command: the first try plus two retries.
pub const MAX_ATTEMPTS: u32 = 3;

/// A three digit device register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(u16);

impl Register {
    // Remote-control claim
    pub const OPERATING_MODE: Register = Register(41);
    pub const REMOTE_ENABLE: Register = Register(42);
    pub const AUTO_MANUAL: Register = Register(43);
    pub const FAN_CONTROL: Register = Register(44);
    pub const CONTROL_AUTHORITY: Register = Register(54);

    // Level control
    pub const SPEED_1: Register = Register(151);
    pub const SPEED_3: Register = Register(152);
    pub const SPEED_4: Register = Register(154);
    pub const BOOST_INHIBIT: Register = Register(326);

    // Telemetry, read only
    pub const INDOOR_TEMP: Register = Register(30);
    pub const OUTDOOR_TEMP: Register = Register(31);
    pub const FRESH_TEMP: Register = Register(32);
    pub const HUMIDITY: Register = Register(36);
    pub const RUNTIME_HOURS: Register = Register(60);
    pub const STATUS_WORD: Register = Register(61);

    pub fn new(address: u16) -> Result<Self> {
        if address > 999 {
            return Err(ControllerError::InvalidRegister(address));
        }
        Ok(Self(address))
    }

    pub fn address(self) -> u16 {
        self.0
    }

    /// Registers that toggle fan speed or the inhibit flag wait for a quiet bus.
    pub fn needs_quiet_period(self) -> bool {
        matches!(self.0, 151 | 152 | 154 | 326)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// One register write with a human label, used to build command sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterCommand {
    pub register: Register,
    pub value: u16,
    pub label: &'static str,
}

impl RegisterCommand {
    pub const fn new(register: Register, value: u16, label: &'static str) -> Self {
        Self { register, value, label }
    }

    pub fn frame(&self) -> String {
        write_frame(self.register, self.value)
    }
}

/// `u16` values never exceed five digits, so the frame is always 12 bytes.
pub fn write_frame(register: Register, value: u16) -> String {
    format!("{}0+{:05}\r\n", register, value)
}

pub fn read_frame(register: Register) -> String {
    format!("{}1xxxxxx\r\n", register)
}

/// Check that a response echoes `register`. Empty or short replies count as
/// no response.
pub fn check_echo(register: Register, response: &[u8]) -> Result<()> {
    if response.is_empty() {
        return Err(ControllerError::NoResponse { register: register.to_string() });
    }
    let decoded = String::from_utf8_lossy(response);
    let expected = register.to_string();
    match decoded.get(0..3) {
        Some(echoed) if echoed == expected => Ok(()),
        _ => Err(ControllerError::RegisterMismatch {
            expected,
            received: decoded.trim_end().to_string(),
        }),
    }
}

/// Value of the first CRLF-separated token of at least nine characters whose
/// leading three characters are digits. The value is taken from characters
/// 4..9 of that token.
pub fn parse_read_response(response: &[u8]) -> Option<i32> {
    let decoded = String::from_utf8_lossy(response);
    decoded
        .split("\r\n")
        .filter(|token| token.len() >= 9)
        .filter(|token| token.bytes().take(3).all(|b| b.is_ascii_digit()))
        .find_map(|token| token.get(4..9)?.trim().parse::<i32>().ok())
}

pub struct CommandProtocol {
    transport: Transport,
    state: SharedState,
    log: Arc<EventLog>,
}

impl CommandProtocol {
    pub fn new(transport: Transport, state: SharedState, log: Arc<EventLog>) -> Self {
        Self { transport, state, log }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Write `value` to `register`, retrying on silence or mismatch.
    ///
    /// Returns `false` once every attempt has failed; the failure is logged
    /// with the register and value.
    pub fn send(&self, register: Register, value: u16) -> bool {
        self.execute(register, value).is_ok()
    }

    /// Same as [`send`](Self::send) but keeps the terminal error for callers
    /// that attach step context.
    pub fn execute(&self, register: Register, value: u16) -> Result<()> {
        match self.try_send(register, value) {
            Ok(attempts) => {
                let mut state = self.state.lock();
                state.last_command = Some(format!("{}={}", register, value));
                state.last_command_time = Some(Utc::now());
                drop(state);
                debug!(%register, value, attempts, "command acknowledged");
                Ok(())
            }
            Err(e) => {
                self.log.append(
                    LogKind::Error,
                    "Serial command failed",
                    json!({ "register": register.to_string(), "value": value, "error": e.to_string() }),
                );
                Err(e)
            }
        }
    }

    /// Returns the number of attempts used on success.
    pub fn try_send(&self, register: Register, value: u16) -> Result<u32> {
        let frame = write_frame(register, value);
        let gate = register.needs_quiet_period();
        let mut attempt = 1;
        loop {
            let outcome = self
                .transport
                .exchange(frame.as_bytes(), gate)
                .and_then(|resp| check_echo(register, &resp));
            match outcome {
                Ok(()) => return Ok(attempt),
                Err(e) if attempt < MAX_ATTEMPTS && e.is_retryable() => {
                    warn!(%register, value, attempt, error = %e, "command attempt failed, retrying");
                    let backoff = self.transport.timing().retry_backoff;
                    if !backoff.is_zero() {
                        thread::sleep(backoff);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!(%register, value, attempt, error = %e, "command failed");
                    return Err(e);
                }
            }
        }
    }

    /// Read a register. Any I/O or parse failure yields `None`.
    pub fn read(&self, register: Register) -> Option<i32> {
        let frame = read_frame(register);
        match self.transport.probe(frame.as_bytes()) {
            Ok(resp) => {
                let value = parse_read_response(&resp);
                if value.is_none() {
                    debug!(%register, response = %String::from_utf8_lossy(&resp).trim_end(), "unparseable read response");
                }
                value
            }
            Err(e) => {
                debug!(%register, error = %e, "register read failed");
                None
            }
        }
    }

    /// Claim remote control authority. Sent once at startup, no echo check.
    pub fn claim_remote_control(&self) -> bool {
        let frames: Vec<Vec<u8>> = REMOTE_CONTROL_CLAIM
            .iter()
            .map(|cmd| cmd.frame().into_bytes())
            .collect();
        match self.transport.write_batch(&frames) {
            Ok(()) => {
                for cmd in REMOTE_CONTROL_CLAIM.iter() {
                    debug!(register = %cmd.register, value = cmd.value, "{}", cmd.label);
                }
                info!(port = %self.transport.describe(), "remote control enabled");
                self.log.log(LogKind::System, "Remote control enabled");
                true
            }
            Err(e) => {
                self.log.append(
                    LogKind::Error,
                    "Failed to enable remote control",
                    json!({ "error": e.to_string() }),
                );
                false
            }
        }
    }
}

pub const REMOTE_CONTROL_CLAIM: [RegisterCommand; 5] = [
    RegisterCommand::new(Register::OPERATING_MODE, 0, "Operating Mode = 0"),
    RegisterCommand::new(Register::AUTO_MANUAL, 1, "Auto/Manual = 1"),
    RegisterCommand::new(Register::FAN_CONTROL, 0, "Fan Control = 0"),
    RegisterCommand::new(Register::REMOTE_ENABLE, 1, "Remote Enable = 1"),
    RegisterCommand::new(Register::CONTROL_AUTHORITY, 1, "Control Authority = 1"),
];
