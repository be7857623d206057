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


//! Service wiring: shared state, the background workers and the operations
//! a control surface calls.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info};

use crate::config::{
    NightQuietPatch, NightQuietSettings, RuntimeConfig, SensorEntity, Settings, SettingsPatch,
    SettingsStore, SharedSettings,
};
use crate::controller::{evaluate, AutoStatus};
use crate::device::{Device, DeviceState, FanLevel, SharedState};
use crate::error::{ControllerError, Result};
use crate::history::{History, HistorySample, DEFAULT_HISTORY_LIMIT};
use crate::learning::LearningState;
use crate::logger::{EventLog, LogEntry, LogKind};
use crate::manual_override::ManualOverride;
use crate::night_quiet::NightQuietGuard;
use crate::protocol::CommandProtocol;
use crate::serial::{Connector, SerialConnector, Timing, Transport};
use crate::telemetry::{compute_metrics, fetch_humidity, HomeAssistantSource, HumiditySource, Metrics, NullSource};

pub const DEFAULT_LOG_LIMIT: usize = 100;

const STOP_POLL: Duration = Duration::from_millis(100);

// ----------------------------------------------------------------------------
// Clock
// ----------------------------------------------------------------------------

/// Wall-clock access, injectable for tests and simulations.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    /// Local time of day, used for quiet hours.
    fn local_time(&self) -> NaiveTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_time(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<(DateTime<Utc>, NaiveTime)>,
}

impl FixedClock {
    pub fn new(utc: DateTime<Utc>, local: NaiveTime) -> Self {
        Self { now: Mutex::new((utc, local)) }
    }

    pub fn set(&self, utc: DateTime<Utc>, local: NaiveTime) {
        *self.now.lock() = (utc, local);
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        now.0 = now.0 + by;
        now.1 = now.1 + by;
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.now.lock().0
    }

    fn local_time(&self) -> NaiveTime {
        self.now.lock().1
    }
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub device: DeviceState,
    pub mode: &'static str,
    pub auto_enabled: bool,
    pub manual_override_until: Option<DateTime<Utc>>,
    pub night_quiet_enabled: bool,
    pub night_quiet_active: bool,
    pub metrics: Metrics,
    pub auto_status: AutoStatus,
    pub ha_humidity: BTreeMap<String, Option<f64>>,
    pub learning_offsets: BTreeMap<String, f64>,
    pub settings: Settings,
    pub history_samples: usize,
    pub log_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIntervals {
    pub sensor_refresh: Duration,
    pub auto_tick: Duration,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            sensor_refresh: Duration::from_secs(60),
            auto_tick: Duration::from_secs(15),
        }
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

pub struct Service {
    device: Device,
    settings: SharedSettings,
    store: SettingsStore,
    log: Arc<EventLog>,
    history: Mutex<History>,
    learning: Mutex<LearningState>,
    auto_status: Mutex<AutoStatus>,
    metrics: Mutex<Metrics>,
    humidity: Mutex<BTreeMap<String, Option<f64>>>,
    night_quiet: NightQuietGuard,
    manual_override: ManualOverride,
    source: Box<dyn HumiditySource>,
    clock: Arc<dyn Clock>,
    intervals: WorkerIntervals,
    started: AtomicBool,
    stopping: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Wire a service around an arbitrary link. Settings are loaded from
    /// `store` immediately; the humidity source defaults to [`NullSource`].
    pub fn new(connector: Box<dyn Connector>, timing: Timing, store: SettingsStore, log: Arc<EventLog>) -> Self {
        let settings = store.load();
        let state = SharedState::default();
        let protocol = CommandProtocol::new(Transport::new(connector, timing), state.clone(), log.clone());
        let learning = LearningState::new(store.sensors().iter().map(|s| s.entity_id.as_str()));

        Self {
            device: Device::new(protocol, state, log.clone()),
            settings: Arc::new(Mutex::new(settings)),
            store,
            manual_override: ManualOverride::new(log.clone()),
            log,
            history: Mutex::new(History::default()),
            learning: Mutex::new(learning),
            auto_status: Mutex::new(AutoStatus::default()),
            metrics: Mutex::new(Metrics::default()),
            humidity: Mutex::new(BTreeMap::new()),
            night_quiet: NightQuietGuard::new(),
            source: Box::new(NullSource),
            clock: Arc::new(SystemClock),
            intervals: WorkerIntervals::default(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Production wiring: real serial port, device timing, Home Assistant telemetry.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let log = Arc::new(EventLog::new(Some(config.log_path.clone())));
        let service = Self::new(
            Box::new(SerialConnector::new(config.serial_port.clone())),
            Timing::device(),
            config.settings_store(),
            log,
        );
        let source = HomeAssistantSource::new(service.settings.clone(), service.log.clone());
        service.with_source(source)
    }

    pub fn with_source(mut self, source: impl HumiditySource + 'static) -> Self {
        self.source = Box::new(source);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_intervals(mut self, intervals: WorkerIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    fn sensors(&self) -> &[SensorEntity] {
        self.store.sensors()
    }

    fn persist(&self, settings: &Settings) {
        if let Err(e) = self.store.save(settings) {
            error!(error = %e, "failed to persist settings");
            self.log.append(LogKind::Error, "Failed to save settings", json!({ "error": e.to_string() }));
        }
    }

    fn schedule_override(&self) {
        let minutes = self.settings.lock().auto_mode.override_minutes;
        self.manual_override.schedule_at(minutes, self.clock.now_utc());
    }

    // ------------------------------------------------------------------------
    // Manual commands
    // ------------------------------------------------------------------------

    /// Apply a manual level, capped by quiet hours. Returns the level actually applied.
    pub fn set_level(&self, level: u8) -> Result<FanLevel> {
        let requested = FanLevel::try_from(level)?;
        let cfg = self.settings.lock().night_quiet.clone();
        let (level, capped) = self.night_quiet.enforce(&cfg, requested, self.clock.local_time());
        if capped {
            self.log.append(
                LogKind::Mode,
                "Requested level capped due to quiet hours",
                json!({ "requested_level": requested, "capped_level": level }),
            );
        }

        if !self.device.apply_level(level) {
            return Err(ControllerError::rejected("Command sequence failed"));
        }
        self.schedule_override();
        Ok(level)
    }

    pub fn turn_off(&self) -> Result<()> {
        if !self.device.turn_off() {
            return Err(ControllerError::rejected("Command sequence failed"));
        }
        self.schedule_override();
        Ok(())
    }

    /// Flip boost with a single speed-4 write. Returns the new boost state.
    pub fn toggle_boost(&self) -> Result<bool> {
        let enabled = self
            .device
            .toggle_boost()
            .ok_or_else(|| ControllerError::rejected("Command failed"))?;
        self.schedule_override();
        Ok(enabled)
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    pub fn set_auto_mode(&self, enabled: bool) -> bool {
        let snapshot = {
            let mut settings = self.settings.lock();
            settings.auto_mode.enabled = enabled;
            settings.clone()
        };
        self.persist(&snapshot);
        self.log.log(
            LogKind::Mode,
            format!("Auto mode {}", if enabled { "enabled" } else { "disabled" }),
        );
        enabled
    }

    pub fn update_night_quiet(&self, patch: &NightQuietPatch) -> Result<NightQuietSettings> {
        let snapshot = {
            let mut settings = self.settings.lock();
            patch.apply(&mut settings.night_quiet)?;
            settings.clone()
        };
        self.persist(&snapshot);
        self.log.log(
            LogKind::Mode,
            format!(
                "Night quiet hours {}",
                if snapshot.night_quiet.enabled { "enabled" } else { "disabled" }
            ),
        );
        Ok(snapshot.night_quiet)
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }

    pub fn update_settings(&self, patch: &SettingsPatch) -> Result<Settings> {
        let snapshot = {
            let mut settings = self.settings.lock();
            settings.apply_patch(patch, self.store.sensors())?;
            settings.clone()
        };
        self.persist(&snapshot);
        self.log.append(LogKind::Settings, "Settings updated", json!({ "payload": patch }));
        Ok(snapshot)
    }

    // ------------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------------

    pub fn snapshot(&self) -> Snapshot {
        let settings = self.settings();
        let (history_samples, log_entries) = (self.history.lock().len(), self.log.len());
        Snapshot {
            device: self.device.snapshot(),
            mode: if settings.auto_mode.enabled { "auto" } else { "manual" },
            auto_enabled: settings.auto_mode.enabled,
            manual_override_until: self.manual_override.expires_at(),
            night_quiet_enabled: settings.night_quiet.enabled,
            night_quiet_active: self.night_quiet.is_active(),
            metrics: self.metrics.lock().clone(),
            auto_status: self.auto_status.lock().clone(),
            ha_humidity: self.humidity.lock().clone(),
            learning_offsets: self.learning.lock().offsets().clone(),
            settings,
            history_samples,
            log_entries,
        }
    }

    pub fn logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        self.log.tail(limit.unwrap_or(DEFAULT_LOG_LIMIT))
    }

    pub fn history(&self, limit: Option<usize>) -> Vec<HistorySample> {
        self.history.lock().tail(limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
    }

    pub fn auto_status(&self) -> AutoStatus {
        self.auto_status.lock().clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.lock().clone()
    }

    pub fn manual_override_active(&self) -> (bool, Option<f64>) {
        self.manual_override.is_active_at(self.clock.now_utc())
    }

    // ------------------------------------------------------------------------
    // Worker units
    // ------------------------------------------------------------------------

    pub fn refresh_sensors(&self) {
        self.device.refresh_sensors();
    }

    /// One telemetry poll: fetch humidity, update metrics and history.
    pub fn poll_telemetry(&self) {
        let humidity = fetch_humidity(self.source.as_ref(), self.sensors());
        let settings = self.settings();
        let mut metrics = compute_metrics(&humidity, &settings, &self.learning.lock());
        *self.humidity.lock() = humidity;

        let sample = HistorySample {
            ts: self.clock.now_utc(),
            level: self.device.current_level(),
            avg_humidity: metrics.avg_humidity,
            max_humidity: metrics.max_humidity,
            avg_delta: metrics.avg_delta,
            max_delta: metrics.max_delta,
        };
        metrics.time_in_range_pct = {
            let mut history = self.history.lock();
            history.push(sample);
            history.time_in_range_pct()
        };
        debug!(?metrics, "telemetry poll complete");
        *self.metrics.lock() = metrics;
    }

    /// One pass of automatic control.
    pub fn auto_tick(&self) {
        let settings = self.settings();
        if !settings.auto_mode.enabled {
            return;
        }
        let now = self.clock.now_utc();

        let (active, remaining) = self.manual_override.is_active_at(now);
        if active {
            let mut status = self.auto_status.lock();
            status.last_run = Some(now);
            status.recommended_level = None;
            status.reason = Some(format!(
                "Manual override active ({}s left)",
                remaining.unwrap_or(0.0) as i64
            ));
            return;
        }

        let humidity = self.humidity.lock().clone();
        let (recommendation, last_learning_update) = {
            let mut learning = self.learning.lock();
            let rec = evaluate(&humidity, self.sensors(), &settings, &mut learning);
            (rec, learning.last_update())
        };
        let (level, capped) = self
            .night_quiet
            .enforce(&settings.night_quiet, recommendation.level, self.clock.local_time());
        let reason = if capped {
            format!("{} (night quiet cap)", recommendation.reason)
        } else {
            recommendation.reason
        };
        let current = self.device.current_level();

        {
            let mut status = self.auto_status.lock();
            status.last_run = Some(now);
            status.recommended_level = Some(level);
            status.reason = Some(reason.clone());
            status.last_learning_update = last_learning_update;
        }

        if current == Some(level) {
            self.auto_status.lock().applied_level = current.map(FanLevel::as_u8);
            return;
        }
        if self.device.apply_level(level) {
            self.auto_status.lock().applied_level = Some(level.as_u8());
            self.log
                .append(LogKind::Auto, format!("Auto mode set Level {}", level), json!({ "reason": reason }));
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopping.load(Ordering::SeqCst)
    }

    /// Claim remote control and spawn the workers. Returns `false` if the
    /// service was already started.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!(port = %self.device.protocol().transport().describe(), "starting controller service");
        self.log.append(
            LogKind::System,
            "Titon controller starting",
            json!({ "port": self.device.protocol().transport().describe() }),
        );
        self.device.claim_remote_control();

        let workers: [(&str, fn(&Service)); 3] = [
            ("titon-sensors", Service::sensor_loop),
            ("titon-telemetry", Service::telemetry_loop),
            ("titon-auto", Service::auto_loop),
        ];
        let mut handles = self.workers.lock();
        for (name, body) in workers {
            let service = Arc::clone(self);
            match thread::Builder::new().name(name.to_string()).spawn(move || body(&service)) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(worker = name, error = %e, "failed to spawn worker");
                    self.log.append(LogKind::Error, "Worker failed to start", json!({ "worker": name, "error": e.to_string() }));
                }
            }
        }
        true
    }

    /// Ask the workers to stop and wait for them.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.log.log(LogKind::System, "Titon controller stopped");
    }

    /// Sleep for `total` unless asked to stop. Returns `false` on stop.
    fn idle(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while !self.stopping.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(STOP_POLL));
        }
        false
    }

    fn sensor_loop(&self) {
        debug!("sensor refresh worker running");
        while !self.stopping.load(Ordering::SeqCst) {
            self.refresh_sensors();
            if !self.idle(self.intervals.sensor_refresh) {
                break;
            }
        }
    }

    fn telemetry_loop(&self) {
        debug!("telemetry worker running");
        while !self.stopping.load(Ordering::SeqCst) {
            self.poll_telemetry();
            let poll = self.settings.lock().ha.poll_interval_secs();
            if !self.idle(Duration::from_secs(poll)) {
                break;
            }
        }
    }

    fn auto_loop(&self) {
        debug!("auto controller worker running");
        while self.idle(self.intervals.auto_tick) {
            self.auto_tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeBus, Reply};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const BATH: &str = "sensor.bath";

    fn at(h: u32, m: u32) -> Arc<FixedClock> {
        let utc = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        Arc::new(FixedClock::new(utc, NaiveTime::from_hms_opt(h, m, 0).unwrap()))
    }

    struct Fixture {
        service: Service,
        bus: FakeBus,
        clock: Arc<FixedClock>,
        dir: TempDir,
    }

    fn fixture(clock: Arc<FixedClock>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let bus = FakeBus::new(Reply::Echo);
        let store = SettingsStore::new(dir.path().join("settings.json"), vec![SensorEntity::new("Bath", BATH)]);
        let service = Service::new(bus.connector(), Timing::immediate(), store, Arc::new(EventLog::detached()))
            .with_clock(clock.clone());
        Fixture { service, bus, clock, dir }
    }

    fn with_humidity(f: Fixture, value: f64) -> Fixture {
        let Fixture { service, bus, clock, dir } = f;
        let service = service.with_source(move |id: &str| if id == BATH { Some(value) } else { None });
        Fixture { service, bus, clock, dir }
    }

    #[test]
    fn test_set_level_rejects_out_of_range() {
        let f = fixture(at(12, 0));
        assert!(matches!(f.service.set_level(0), Err(ControllerError::InvalidLevel(0))));
        assert!(matches!(f.service.set_level(5), Err(ControllerError::InvalidLevel(5))));
        assert!(f.bus.written().is_empty());
        assert!(f.service.snapshot().manual_override_until.is_none());
    }

    #[test]
    fn test_set_level_capped_at_night_and_schedules_override() {
        let f = fixture(at(23, 0));
        assert_eq!(f.service.set_level(4).unwrap(), FanLevel::Two);

        let snap = f.service.snapshot();
        assert_eq!(snap.device.current_level, Some(FanLevel::Two));
        assert!(snap.night_quiet_active);
        assert_eq!(
            snap.manual_override_until,
            Some(f.clock.now_utc() + chrono::Duration::minutes(15))
        );
        let logs = f.service.logs(None);
        assert!(logs.iter().any(|e| e.message == "Requested level capped due to quiet hours"
            && e.meta["capped_level"] == 2));
    }

    #[test]
    fn test_set_level_failure_is_rejected_without_override() {
        let f = fixture(at(12, 0));
        f.bus.script(vec![Reply::Silent; 3]);
        let err = f.service.set_level(3).unwrap_err();
        assert!(matches!(err, ControllerError::Rejected(_)));
        assert!(f.service.snapshot().manual_override_until.is_none());
        assert_eq!(f.service.device().current_level(), None);
    }

    #[test]
    fn test_turn_off_and_boost_schedule_override() {
        let f = fixture(at(12, 0));
        assert!(f.service.toggle_boost().unwrap());
        assert!(f.service.manual_override_active().0);
        assert!(f.service.turn_off().is_ok());
        assert_eq!(f.service.device().current_level(), None);
    }

    #[test]
    fn test_auto_tick_noop_when_disabled() {
        let f = with_humidity(fixture(at(12, 0)), 70.0);
        f.service.poll_telemetry();
        f.service.auto_tick();
        assert!(f.bus.written().is_empty());
        assert_eq!(f.service.auto_status(), AutoStatus::default());
    }

    #[test]
    fn test_auto_tick_respects_override() {
        let f = with_humidity(fixture(at(12, 0)), 70.0);
        f.service.set_auto_mode(true);
        f.service.update_settings(&serde_json::from_value(json!({ "auto_mode": { "override_minutes": 10 } })).unwrap()).unwrap();
        f.service.set_level(1).unwrap();
        f.bus.clear_written();

        f.service.poll_telemetry();
        f.service.auto_tick();
        let status = f.service.auto_status();
        assert_eq!(status.reason.as_deref(), Some("Manual override active (600s left)"));
        assert_eq!(status.recommended_level, None);
        assert!(f.bus.written().is_empty());

        // Once the window closes the controller takes over again.
        f.clock.advance(chrono::Duration::minutes(11));
        f.service.auto_tick();
        assert_eq!(f.service.device().current_level(), Some(FanLevel::Four));
    }

    #[test]
    fn test_auto_tick_applies_recommendation() {
        let f = with_humidity(fixture(at(12, 0)), 62.0);
        f.service.set_auto_mode(true);
        f.service.poll_telemetry();
        f.service.auto_tick();

        let status = f.service.auto_status();
        assert_eq!(status.recommended_level, Some(FanLevel::Four));
        assert_eq!(status.applied_level, Some(4));
        assert_eq!(status.reason.as_deref(), Some("avgΔ 7.0%, maxΔ 7.0%"));
        assert_eq!(f.service.logs(Some(1))[0].message, "Auto mode set Level 4");

        // Same recommendation again: nothing is written.
        f.bus.clear_written();
        f.service.auto_tick();
        assert!(f.bus.written().is_empty());
        assert_eq!(f.service.auto_status().applied_level, Some(4));
    }

    #[test]
    fn test_auto_tick_night_cap_in_reason() {
        let f = with_humidity(fixture(at(22, 30)), 70.0);
        f.service.set_auto_mode(true);
        f.service.poll_telemetry();
        f.service.auto_tick();

        let status = f.service.auto_status();
        assert_eq!(status.recommended_level, Some(FanLevel::Two));
        assert!(status.reason.unwrap().ends_with(" (night quiet cap)"));
        assert_eq!(f.service.device().current_level(), Some(FanLevel::Two));
    }

    #[test]
    fn test_auto_tick_without_data_holds_level_two() {
        let f = fixture(at(12, 0));
        f.service.set_auto_mode(true);
        f.service.poll_telemetry();
        f.service.auto_tick();
        let status = f.service.auto_status();
        assert_eq!(status.recommended_level, Some(FanLevel::Two));
        assert_eq!(status.reason.as_deref(), Some("No humidity data - staying at Level 2"));
    }

    #[test]
    fn test_poll_telemetry_updates_history_and_metrics() {
        let f = with_humidity(fixture(at(12, 0)), 50.0);
        f.service.poll_telemetry();
        f.service.poll_telemetry();

        let metrics = f.service.metrics();
        assert_eq!(metrics.avg_humidity, Some(50.0));
        assert_eq!(metrics.max_delta, Some(-5.0));
        assert_eq!(metrics.time_in_range_pct, Some(100.0));
        assert_eq!(f.service.history(None).len(), 2);
        assert_eq!(f.service.snapshot().ha_humidity.get(BATH), Some(&Some(50.0)));
    }

    #[test]
    fn test_settings_changes_persist() {
        let f = fixture(at(12, 0));
        f.service.set_auto_mode(true);
        f.service
            .update_night_quiet(&NightQuietPatch { max_level: Some(3), ..Default::default() })
            .unwrap();
        assert!(f
            .service
            .update_night_quiet(&NightQuietPatch { end: Some("8am".into()), ..Default::default() })
            .is_err());

        let store = SettingsStore::new(f.dir.path().join("settings.json"), vec![SensorEntity::new("Bath", BATH)]);
        let on_disk = store.try_load().unwrap();
        assert!(on_disk.auto_mode.enabled);
        assert_eq!(on_disk.night_quiet.max_level, 3);
        assert_eq!(on_disk.night_quiet.end, "08:00");
        assert_eq!(f.service.snapshot().mode, "auto");
    }

    #[test]
    fn test_start_is_idempotent_and_shutdown_joins() {
        let f = fixture(at(12, 0));
        let service = Arc::new(f.service);
        assert!(service.start());
        assert!(!service.start());
        assert!(service.is_running());
        service.shutdown();
        assert!(!service.is_running());

        let claimed: Vec<String> = f.bus.writes().into_iter().take(5).map(|(r, _)| r).collect();
        assert_eq!(claimed, vec!["041", "043", "044", "042", "054"]);
        assert_eq!(service.logs(Some(1))[0].message, "Titon controller stopped");
    }
}
