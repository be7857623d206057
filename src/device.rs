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

//! Device state machine.
//!
//! Each fan level is reached through an ordered register sequence. A failed
//! step aborts the sequence and leaves [`DeviceState`] untouched, even though
//! the unit itself may now sit in a partially applied configuration.

use std::fmt;
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{ControllerError, Result};
use crate::logger::{EventLog, LogKind};
use crate::protocol::{CommandProtocol, Register, RegisterCommand};
use crate::status::decode_status_word;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FanLevel {
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
}

impl FanLevel {
    pub const ALL: [FanLevel; 4] = [FanLevel::One, FanLevel::Two, FanLevel::Three, FanLevel::Four];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Levels 1 and 2 hold the boost-inhibit flag.
    pub fn inhibits_boost(self) -> bool {
        matches!(self, FanLevel::One | FanLevel::Two)
    }
}

impl TryFrom<u8> for FanLevel {
    type Error = ControllerError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(FanLevel::One),
            2 => Ok(FanLevel::Two),
            3 => Ok(FanLevel::Three),
            4 => Ok(FanLevel::Four),
            other => Err(ControllerError::InvalidLevel(other)),
        }
    }
}

impl From<FanLevel> for u8 {
    fn from(level: FanLevel) -> u8 {
        level.as_u8()
    }
}

impl fmt::Display for FanLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReadings {
    pub indoor_temp: Option<f64>,
    pub outdoor_temp: Option<f64>,
    pub fresh_temp: Option<f64>,
    pub humidity: Option<i32>,
    pub runtime_hours: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub raw: Option<u16>,
    pub flags: Vec<String>,
}

/// In-memory mirror of the commands issued to the unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub current_level: Option<FanLevel>,
    pub boost_active: bool,
    pub boost_inhibit: bool,
    pub last_command: Option<String>,
    pub last_command_time: Option<DateTime<Utc>>,
    pub level_start_time: Option<DateTime<Utc>>,
    pub status: StatusReport,
    pub sensors: SensorReadings,
}

pub type SharedState = Arc<Mutex<DeviceState>>;

const LEVEL_1: [RegisterCommand; 5] = [
    RegisterCommand::new(Register::SPEED_4, 0, "Speed 4 OFF"),
    RegisterCommand::new(Register::SPEED_3, 0, "Speed 3 OFF"),
    RegisterCommand::new(Register::SPEED_1, 0, "Speed 1 OFF"),
    RegisterCommand::new(Register::BOOST_INHIBIT, 1, "Boost Inhibit ON (block Speed 3/4)"),
    RegisterCommand::new(Register::SPEED_1, 1, "Speed 1 ON"),
];

// Level 2 is the unit's default speed once every other speed is off.
const LEVEL_2: [RegisterCommand; 4] = [
    RegisterCommand::new(Register::SPEED_4, 0, "Speed 4 OFF"),
    RegisterCommand::new(Register::SPEED_3, 0, "Speed 3 OFF"),
    RegisterCommand::new(Register::SPEED_1, 0, "Speed 1 OFF"),
    RegisterCommand::new(Register::BOOST_INHIBIT, 1, "Boost Inhibit ON (hold default Speed 2)"),
];

const LEVEL_3: [RegisterCommand; 4] = [
    RegisterCommand::new(Register::BOOST_INHIBIT, 0, "Boost Inhibit OFF"),
    RegisterCommand::new(Register::SPEED_4, 0, "Speed 4 OFF"),
    RegisterCommand::new(Register::SPEED_1, 0, "Speed 1 OFF"),
    RegisterCommand::new(Register::SPEED_3, 1, "Speed 3 ON"),
];

const LEVEL_4: [RegisterCommand; 4] = [
    RegisterCommand::new(Register::BOOST_INHIBIT, 0, "Boost Inhibit OFF"),
    RegisterCommand::new(Register::SPEED_3, 0, "Speed 3 OFF"),
    RegisterCommand::new(Register::SPEED_1, 0, "Speed 1 OFF"),
    RegisterCommand::new(Register::SPEED_4, 1, "Speed 4 ON"),
];

pub const TURN_OFF_SEQUENCE: [RegisterCommand; 4] = [
    RegisterCommand::new(Register::SPEED_1, 0, "Speed 1 OFF"),
    RegisterCommand::new(Register::SPEED_3, 0, "Speed 3 OFF"),
    RegisterCommand::new(Register::SPEED_4, 0, "Speed 4 OFF"),
    RegisterCommand::new(Register::BOOST_INHIBIT, 0, "Boost Inhibit OFF"),
];

/// Register sequence that reaches `level`.
pub fn level_strategy(level: FanLevel) -> &'static [RegisterCommand] {
    match level {
        FanLevel::One => &LEVEL_1,
        FanLevel::Two => &LEVEL_2,
        FanLevel::Three => &LEVEL_3,
        FanLevel::Four => &LEVEL_4,
    }
}

pub struct Device {
    protocol: CommandProtocol,
    state: SharedState,
    log: Arc<EventLog>,
    // Held across a whole sequence and its state update so sequences never interleave.
    sequence: Mutex<()>,
}

impl Device {
    pub fn new(protocol: CommandProtocol, state: SharedState, log: Arc<EventLog>) -> Self {
        Self { protocol, state, log, sequence: Mutex::new(()) }
    }

    pub fn protocol(&self) -> &CommandProtocol {
        &self.protocol
    }

    pub fn snapshot(&self) -> DeviceState {
        self.state.lock().clone()
    }

    pub fn current_level(&self) -> Option<FanLevel> {
        self.state.lock().current_level
    }

    /// Run the level strategy; state changes only if every step succeeds.
    pub fn apply_level(&self, level: FanLevel) -> bool {
        let _sequence = self.sequence.lock();
        if let Err(e) = self.run_sequence(level_strategy(level)) {
            let step = match &e {
                ControllerError::SequenceStep { step, .. } => *step,
                _ => "unknown",
            };
            self.log.append(
                LogKind::Error,
                "Level strategy step failed",
                json!({ "step": step, "level": level.as_u8() }),
            );
            return false;
        }

        {
            let mut state = self.state.lock();
            state.boost_inhibit = level.inhibits_boost();
            state.boost_active = level == FanLevel::Four;
            state.current_level = Some(level);
            state.level_start_time = Some(Utc::now());
        }
        self.log.append(LogKind::Control, format!("Level {} applied", level), json!({ "strategy": true }));
        true
    }

    pub fn turn_off(&self) -> bool {
        let _sequence = self.sequence.lock();
        if let Err(e) = self.run_sequence(&TURN_OFF_SEQUENCE) {
            let step = match &e {
                ControllerError::SequenceStep { step, .. } => *step,
                _ => "unknown",
            };
            self.log.append(LogKind::Error, "Turn off step failed", json!({ "step": step }));
            return false;
        }

        {
            let mut state = self.state.lock();
            state.current_level = None;
            state.boost_active = false;
            state.boost_inhibit = false;
            state.level_start_time = None;
        }
        self.log.log(LogKind::Control, "All levels turned off");
        true
    }

    /// Flip speed 4 directly, bypassing the level strategy.
    ///
    /// Returns the new boost state on success. Turning boost on marks the unit
    /// as level 4; turning it off leaves the recorded level alone.
    ///
    /// Register 326 is not touched, so boosting from level 1 or 2 leaves
    /// `boost_inhibit` set alongside level 4. That mirrors the unit, where the
    /// inhibit flag really is still raised.
    pub fn toggle_boost(&self) -> Option<bool> {
        let _sequence = self.sequence.lock();
        let enable = !self.state.lock().boost_active;
        if !self.protocol.send(Register::SPEED_4, u16::from(enable)) {
            return None;
        }
        {
            let mut state = self.state.lock();
            state.boost_active = enable;
            if enable {
                state.current_level = Some(FanLevel::Four);
                state.level_start_time = Some(Utc::now());
            }
        }
        self.log.log(LogKind::Control, format!("Boost {}", if enable { "ON" } else { "OFF" }));
        Some(enable)
    }

    /// Poll the telemetry and status registers. Fields whose read fails keep
    /// their previous value.
    pub fn refresh_sensors(&self) {
        let indoor = self.protocol.read(Register::INDOOR_TEMP);
        let outdoor = self.protocol.read(Register::OUTDOOR_TEMP);
        let fresh = self.protocol.read(Register::FRESH_TEMP);
        let humidity = self.protocol.read(Register::HUMIDITY);
        let runtime = self.protocol.read(Register::RUNTIME_HOURS);
        let status = self.protocol.read(Register::STATUS_WORD);

        let mut state = self.state.lock();
        if let Some(v) = indoor {
            state.sensors.indoor_temp = Some(f64::from(v) / 10.0);
        }
        if let Some(v) = outdoor {
            state.sensors.outdoor_temp = Some(f64::from(v) / 10.0);
        }
        if let Some(v) = fresh {
            state.sensors.fresh_temp = Some(f64::from(v) / 10.0);
        }
        if humidity.is_some() {
            state.sensors.humidity = humidity;
        }
        if runtime.is_some() {
            state.sensors.runtime_hours = runtime;
        }
        match status.map(u16::try_from) {
            Some(Ok(word)) => {
                state.status.raw = Some(word);
                state.status.flags = decode_status_word(word).into_iter().map(String::from).collect();
            }
            Some(Err(_)) => debug!(?status, "status word out of range"),
            None => {}
        }
    }

    pub fn claim_remote_control(&self) -> bool {
        self.protocol.claim_remote_control()
    }

    fn run_sequence(&self, steps: &[RegisterCommand]) -> Result<()> {
        let delay = self.protocol.transport().timing().step_delay;
        for step in steps {
            self.protocol
                .execute(step.register, step.value)
                .map_err(|e| ControllerError::SequenceStep {
                    step: step.label,
                    source: Box::new(e),
                })?;
            debug!(register = %step.register, value = step.value, "{}", step.label);
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::serial::{Timing, Transport};
    use crate::status::NO_ERRORS;
    use crate::test_utils::{FakeBus, Reply};

    fn device(bus: &FakeBus) -> (Device, Arc<EventLog>) {
        device_with_timing(bus, Timing::immediate())
    }

    fn device_with_timing(bus: &FakeBus, timing: Timing) -> (Device, Arc<EventLog>) {
        let state = SharedState::default();
        let log = Arc::new(EventLog::detached());
        let transport = Transport::new(bus.connector(), timing);
        let protocol = CommandProtocol::new(transport, state.clone(), log.clone());
        (Device::new(protocol, state, log.clone()), log)
    }

    fn regs(writes: &[(String, u32)]) -> Vec<(&str, u32)> {
        writes.iter().map(|(r, v)| (r.as_str(), *v)).collect()
    }

    #[test]
    fn test_fan_level_conversions() {
        assert_eq!(FanLevel::try_from(3u8).unwrap(), FanLevel::Three);
        assert!(FanLevel::try_from(0u8).is_err());
        assert!(FanLevel::try_from(5u8).is_err());
        assert_eq!(u8::from(FanLevel::Four), 4);
        assert_eq!(serde_json::to_string(&Some(FanLevel::Two)).unwrap(), "2");
        assert!(serde_json::from_str::<FanLevel>("7").is_err());
    }

    #[test]
    fn test_level_invariants_after_apply() {
        for level in FanLevel::ALL {
            let bus = FakeBus::new(Reply::Echo);
            let (dev, _) = device(&bus);
            assert!(dev.apply_level(level));
            let state = dev.snapshot();
            assert_eq!(state.current_level, Some(level));
            assert_eq!(state.boost_inhibit, matches!(level, FanLevel::One | FanLevel::Two));
            assert_eq!(state.boost_active, level == FanLevel::Four);
            assert!(state.level_start_time.is_some());
        }
    }

    #[test]
    fn test_level_one_sequence_order() {
        let bus = FakeBus::new(Reply::Echo);
        let (dev, _) = device(&bus);
        assert!(dev.apply_level(FanLevel::One));
        assert_eq!(
            regs(&bus.writes()),
            vec![("154", 0), ("152", 0), ("151", 0), ("326", 1), ("151", 1)]
        );
    }

    #[test]
    fn test_level_four_sequence_order() {
        let bus = FakeBus::new(Reply::Echo);
        let (dev, _) = device(&bus);
        assert!(dev.apply_level(FanLevel::Four));
        assert_eq!(regs(&bus.writes()), vec![("326", 0), ("152", 0), ("151", 0), ("154", 1)]);
    }

    #[test]
    fn test_failed_step_leaves_state_unmodified() {
        let bus = FakeBus::new(Reply::Echo);
        let (dev, log) = device(&bus);
        assert!(dev.apply_level(FanLevel::Two));
        let before = dev.snapshot();

        // Step 1 succeeds, step 2 exhausts all three attempts.
        bus.script(vec![Reply::Echo, Reply::Silent, Reply::Silent, Reply::Silent]);
        bus.clear_written();
        assert!(!dev.apply_level(FanLevel::Three));

        let after = dev.snapshot();
        assert_eq!(after.current_level, before.current_level);
        assert_eq!(after.boost_inhibit, before.boost_inhibit);
        assert_eq!(after.boost_active, before.boost_active);
        assert_eq!(after.level_start_time, before.level_start_time);
        // Aborted after the second step, the remaining two never went out.
        assert_eq!(bus.writes().len(), 4);

        let entry = &log.tail(1)[0];
        assert_eq!(entry.message, "Level strategy step failed");
        assert_eq!(entry.meta["step"], "Speed 4 OFF");
        assert_eq!(entry.meta["level"], 3);
    }

    #[test]
    fn test_turn_off_clears_state() {
        let bus = FakeBus::new(Reply::Echo);
        let (dev, _) = device(&bus);
        assert!(dev.apply_level(FanLevel::Four));
        bus.clear_written();
        assert!(dev.turn_off());
        assert_eq!(regs(&bus.writes()), vec![("151", 0), ("152", 0), ("154", 0), ("326", 0)]);
        let state = dev.snapshot();
        assert_eq!(state.current_level, None);
        assert!(!state.boost_active);
        assert!(!state.boost_inhibit);
        assert!(state.level_start_time.is_none());
    }

    #[test]
    fn test_turn_off_failure_keeps_level() {
        let bus = FakeBus::new(Reply::Echo);
        let (dev, log) = device(&bus);
        assert!(dev.apply_level(FanLevel::Three));
        bus.script(vec![Reply::Silent; 3]);
        assert!(!dev.turn_off());
        assert_eq!(dev.current_level(), Some(FanLevel::Three));
        assert_eq!(log.tail(1)[0].meta["step"], "Speed 1 OFF");
    }

    #[test]
    fn test_toggle_boost_single_register() {
        let bus = FakeBus::new(Reply::Echo);
        let (dev, _) = device(&bus);
        assert!(dev.apply_level(FanLevel::Three));
        bus.clear_written();

        assert_eq!(dev.toggle_boost(), Some(true));
        assert_eq!(regs(&bus.writes()), vec![("154", 1)]);
        let state = dev.snapshot();
        assert!(state.boost_active);
        assert_eq!(state.current_level, Some(FanLevel::Four));

        assert_eq!(dev.toggle_boost(), Some(false));
        let state = dev.snapshot();
        assert!(!state.boost_active);
        assert_eq!(state.current_level, Some(FanLevel::Four));
    }

    #[test]
    fn test_toggle_boost_failure() {
        let bus = FakeBus::new(Reply::Silent);
        let (dev, _) = device(&bus);
        assert_eq!(dev.toggle_boost(), None);
        assert!(!dev.snapshot().boost_active);
    }

    #[test]
    fn test_boost_from_low_level_keeps_inhibit_raised() {
        let bus = FakeBus::new(Reply::Echo);
        let (dev, _) = device(&bus);
        assert!(dev.apply_level(FanLevel::One));
        assert_eq!(dev.toggle_boost(), Some(true));

        let state = dev.snapshot();
        assert_eq!(state.current_level, Some(FanLevel::Four));
        assert!(state.boost_active);
        assert!(state.boost_inhibit);
    }

    #[test]
    fn test_concurrent_levels_do_not_interleave() {
        let bus = FakeBus::new(Reply::Echo);
        let timing = Timing { step_delay: Duration::from_millis(20), ..Timing::immediate() };
        let (dev, _) = device_with_timing(&bus, timing);
        let dev = Arc::new(dev);

        let low = {
            let dev = Arc::clone(&dev);
            thread::spawn(move || dev.apply_level(FanLevel::One))
        };
        thread::sleep(Duration::from_millis(5));
        let high = {
            let dev = Arc::clone(&dev);
            thread::spawn(move || dev.apply_level(FanLevel::Four))
        };
        assert!(low.join().unwrap());
        assert!(high.join().unwrap());

        let frames = |level: FanLevel| -> Vec<(String, u32)> {
            level_strategy(level)
                .iter()
                .map(|c| (c.register.to_string(), u32::from(c.value)))
                .collect()
        };
        let one_then_four = [frames(FanLevel::One), frames(FanLevel::Four)].concat();
        let four_then_one = [frames(FanLevel::Four), frames(FanLevel::One)].concat();

        let writes = bus.writes();
        let state = dev.snapshot();
        if writes == one_then_four {
            assert_eq!(state.current_level, Some(FanLevel::Four));
            assert!(state.boost_active);
            assert!(!state.boost_inhibit);
        } else {
            assert_eq!(writes, four_then_one);
            assert_eq!(state.current_level, Some(FanLevel::One));
            assert!(!state.boost_active);
            assert!(state.boost_inhibit);
        }
    }

    #[test]
    fn test_refresh_sensors_scales_and_decodes() {
        let bus = FakeBus::new(Reply::Silent);
        bus.respond_to_read("030", "030100215\r\n");
        bus.respond_to_read("031", "0311-0045\r\n");
        bus.respond_to_read("036", "036100052\r\n");
        bus.respond_to_read("060", "060112345\r\n");
        bus.respond_to_read("061", "061102048\r\n");
        let (dev, _) = device(&bus);
        dev.refresh_sensors();

        let state = dev.snapshot();
        assert_eq!(state.sensors.indoor_temp, Some(21.5));
        assert_eq!(state.sensors.outdoor_temp, Some(-4.5));
        assert_eq!(state.sensors.fresh_temp, None);
        assert_eq!(state.sensors.humidity, Some(52));
        assert_eq!(state.sensors.runtime_hours, Some(12345));
        assert_eq!(state.status.raw, Some(2048));
        assert_eq!(state.status.flags, vec!["Engine running".to_string()]);
    }

    #[test]
    fn test_refresh_keeps_previous_values_on_failure() {
        let bus = FakeBus::new(Reply::Silent);
        bus.respond_to_read("061", "061100000\r\n");
        bus.respond_to_read("036", "036100040\r\n");
        let (dev, _) = device(&bus);
        dev.refresh_sensors();
        assert_eq!(dev.snapshot().status.flags, vec![NO_ERRORS.to_string()]);

        bus.fail_opens(6);
        dev.refresh_sensors();
        let state = dev.snapshot();
        assert_eq!(state.sensors.humidity, Some(40));
        assert_eq!(state.status.raw, Some(0));
    }
}
