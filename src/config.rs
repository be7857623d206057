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


use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::controller::Aggressiveness;
use crate::error::{ControllerError, Result};
use crate::night_quiet::parse_time;

pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB1";
pub const DEFAULT_TARGET: f64 = 55.0;
pub const MIN_POLL_SECONDS: u64 = 10;

const TARGET_MIN: f64 = 30.0;
const TARGET_MAX: f64 = 80.0;

// ----------------------------------------------------------------------------
// Sensors
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorEntity {
    pub name: String,
    pub entity_id: String,
}

impl SensorEntity {
    pub fn new(name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self { name: name.into(), entity_id: entity_id.into() }
    }
}

pub fn default_sensor_entities() -> Vec<SensorEntity> {
    vec![
        SensorEntity::new("Svetainė", "sensor.0x3425b4fffe1283bb_humidity"),
        SensorEntity::new("Miegamo vonia", "sensor.miegamo_vonia_humidity"),
        SensorEntity::new("Miegamasis", "sensor.miegamas_humidity"),
        SensorEntity::new("Jokūbo kambarys", "sensor.jokubo_kambarys_humidity"),
        SensorEntity::new("Darbo kambarys", "sensor.darbo_kambarys_humidity"),
    ]
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SensorEntry {
    Pair(String, String),
    Named { name: String, entity_id: String },
}

/// Parse a JSON array of `[name, entity_id]` pairs or `{"name", "entity_id"}`
/// objects. Entries of any other shape are skipped; `None` if nothing usable remains.
pub fn parse_sensor_entities(raw: &str) -> Option<Vec<SensorEntity>> {
    let items: Vec<Value> = serde_json::from_str(raw).ok()?;
    let parsed: Vec<SensorEntity> = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item).ok()? {
            SensorEntry::Pair(name, entity_id) => Some(SensorEntity { name, entity_id }),
            SensorEntry::Named { name, entity_id } => Some(SensorEntity { name, entity_id }),
        })
        .collect();
    if parsed.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

// ----------------------------------------------------------------------------
// Persisted settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoModeSettings {
    pub enabled: bool,
    pub override_minutes: u32,
    pub aggressiveness: Aggressiveness,
}

impl Default for AutoModeSettings {
    fn default() -> Self {
        Self { enabled: false, override_minutes: 15, aggressiveness: Aggressiveness::Balanced }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NightQuietSettings {
    pub enabled: bool,
    pub start: String,
    pub end: String,
    pub max_level: u8,
}

impl Default for NightQuietSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            start: "21:00".to_string(),
            end: "08:00".to_string(),
            max_level: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaSettings {
    pub url: String,
    pub token: String,
    /// Per-request timeout in seconds.
    pub timeout: u64,
    pub poll_seconds: u64,
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            url: "http://homeassistant.local:8123".to_string(),
            token: String::new(),
            timeout: 5,
            poll_seconds: 30,
        }
    }
}

impl HaSettings {
    pub fn poll_interval_secs(&self) -> u64 {
        self.poll_seconds.max(MIN_POLL_SECONDS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningSettings {
    pub adapt_rate: f64,
    pub max_offset: f64,
    pub sample_window: usize,
}

impl Default for LearningSettings {
    fn default() -> Self {
        // 12 samples is about six minutes at the default poll rate.
        Self { adapt_rate: 0.08, max_offset: 8.0, sample_window: 12 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub auto_mode: AutoModeSettings,
    pub night_quiet: NightQuietSettings,
    pub humidity_targets: BTreeMap<String, f64>,
    pub ha: HaSettings,
    pub learning: LearningSettings,
    /// Top-level keys this version does not know about, kept for the next save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    pub fn defaults(sensors: &[SensorEntity]) -> Self {
        Self {
            auto_mode: AutoModeSettings::default(),
            night_quiet: NightQuietSettings::default(),
            humidity_targets: sensors
                .iter()
                .map(|s| (s.entity_id.clone(), DEFAULT_TARGET))
                .collect(),
            ha: HaSettings::default(),
            learning: LearningSettings::default(),
            extra: Map::new(),
        }
    }

    pub fn target_for(&self, entity_id: &str) -> f64 {
        self.humidity_targets.get(entity_id).copied().unwrap_or(DEFAULT_TARGET)
    }

    /// Apply a partial update. Validation runs first so a rejected patch
    /// leaves the settings untouched.
    pub fn apply_patch(&mut self, patch: &SettingsPatch, sensors: &[SensorEntity]) -> Result<()> {
        if let Some(nq) = &patch.night_quiet {
            nq.validate()?;
        }

        if let Some(targets) = &patch.humidity_targets {
            for sensor in sensors {
                if let Some(target) = targets.get(&sensor.entity_id) {
                    if target.is_finite() {
                        self.humidity_targets
                            .insert(sensor.entity_id.clone(), target.clamp(TARGET_MIN, TARGET_MAX));
                    }
                }
            }
        }
        if let Some(ha) = &patch.ha {
            if let Some(url) = &ha.url {
                self.ha.url = url.clone();
            }
            if let Some(token) = &ha.token {
                self.ha.token = token.clone();
            }
            if let Some(poll) = ha.poll_seconds {
                self.ha.poll_seconds = poll.max(MIN_POLL_SECONDS);
            }
            if let Some(timeout) = ha.timeout {
                self.ha.timeout = timeout.max(1);
            }
        }
        if let Some(auto) = &patch.auto_mode {
            if let Some(minutes) = auto.override_minutes {
                self.auto_mode.override_minutes = minutes.max(1);
            }
            if let Some(aggr) = auto.aggressiveness {
                self.auto_mode.aggressiveness = aggr;
            }
        }
        if let Some(nq) = &patch.night_quiet {
            nq.apply_to(&mut self.night_quiet);
        }
        Ok(())
    }
}

pub type SharedSettings = Arc<Mutex<Settings>>;

/// Shallow-merge a stored settings document into the defaults.
///
/// Each known block is merged key by key (stored keys win, missing keys come
/// from the defaults); anything else at the top level is copied as-is. Every
/// configured sensor ends up with a humidity target.
pub fn merge_with_defaults(stored: Value, sensors: &[SensorEntity]) -> Result<Settings> {
    let Value::Object(stored) = stored else {
        return Err(ControllerError::invalid_config("settings", "top level is not a JSON object"));
    };
    let Value::Object(mut merged) = serde_json::to_value(Settings::defaults(sensors))? else {
        return Err(ControllerError::invalid_config("settings", "defaults did not serialize to an object"));
    };

    for (key, value) in stored {
        match (merged.get_mut(&key), value) {
            (Some(Value::Object(block)), Value::Object(incoming)) => block.extend(incoming),
            (_, value) => {
                merged.insert(key, value);
            }
        }
    }

    let mut settings: Settings = serde_json::from_value(Value::Object(merged))?;
    for sensor in sensors {
        settings
            .humidity_targets
            .entry(sensor.entity_id.clone())
            .or_insert(DEFAULT_TARGET);
    }
    Ok(settings)
}

/// Loads and saves the settings file.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    sensors: Vec<SensorEntity>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>, sensors: Vec<SensorEntity>) -> Self {
        Self { path: path.into(), sensors }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sensors(&self) -> &[SensorEntity] {
        &self.sensors
    }

    /// Load settings, never failing.
    ///
    /// A missing file is created from the defaults. An unreadable or malformed
    /// file yields the defaults and is left on disk as found.
    pub fn load(&self) -> Settings {
        if !self.path.exists() {
            let settings = Settings::defaults(&self.sensors);
            if let Err(e) = self.save(&settings) {
                warn!(error = %e, "could not write default settings");
            }
            return settings;
        }

        match self.try_load() {
            Ok(settings) => {
                if let Err(e) = self.save(&settings) {
                    warn!(error = %e, "could not rewrite merged settings");
                }
                settings
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to load settings, reverting to defaults");
                Settings::defaults(&self.sensors)
            }
        }
    }

    pub fn try_load(&self) -> Result<Settings> {
        let data = fs::read_to_string(&self.path).map_err(|source| ControllerError::FileRead {
            path: self.path.clone(),
            source,
        })?;
        let stored: Value = serde_json::from_str(&data)?;
        merge_with_defaults(stored, &self.sensors)
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, json).map_err(|source| ControllerError::FileWrite {
            path: self.path.clone(),
            source,
        })
    }
}

// ----------------------------------------------------------------------------
// Patches
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub humidity_targets: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub ha: Option<HaPatch>,
    #[serde(default)]
    pub auto_mode: Option<AutoModePatch>,
    #[serde(default)]
    pub night_quiet: Option<NightQuietPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HaPatch {
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout: Option<u64>,
    pub poll_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoModePatch {
    pub override_minutes: Option<u32>,
    pub aggressiveness: Option<Aggressiveness>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NightQuietPatch {
    pub enabled: Option<bool>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub max_level: Option<i64>,
}

impl NightQuietPatch {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [("night_quiet.start", &self.start), ("night_quiet.end", &self.end)] {
            if let Some(v) = value {
                parse_time(v).ok_or_else(|| ControllerError::invalid_config(field, format!("'{}' is not HH:MM", v)))?;
            }
        }
        Ok(())
    }

    fn apply_to(&self, cfg: &mut NightQuietSettings) {
        if let Some(enabled) = self.enabled {
            cfg.enabled = enabled;
        }
        if let Some(start) = &self.start {
            cfg.start = start.clone();
        }
        if let Some(end) = &self.end {
            cfg.end = end.clone();
        }
        if let Some(max) = self.max_level {
            cfg.max_level = max.clamp(1, 4) as u8;
        }
    }

    /// Validate then apply.
    pub fn apply(&self, cfg: &mut NightQuietSettings) -> Result<()> {
        self.validate()?;
        self.apply_to(cfg);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Runtime configuration
// ----------------------------------------------------------------------------

/// Process-level configuration: where things live and which sensors exist.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub serial_port: String,
    pub settings_path: PathBuf,
    pub log_path: PathBuf,
    pub sensors: Vec<SensorEntity>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::resolve(None, None, None)
    }

    /// Explicit values win over environment variables, which win over defaults.
    pub fn resolve(port: Option<String>, settings: Option<PathBuf>, log: Option<PathBuf>) -> Self {
        let serial_port = port
            .or_else(|| env::var("TITON_SERIAL_PORT").ok())
            .unwrap_or_else(|| DEFAULT_SERIAL_PORT.to_string());
        let settings_path = settings
            .or_else(|| env::var("TITON_SETTINGS_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(config_path);
        let log_path = log
            .or_else(|| env::var("TITON_LOG_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| settings_path.with_file_name("events.jsonl"));
        let sensors = match env::var("TITON_SENSOR_ENTITIES") {
            Ok(raw) => parse_sensor_entities(&raw).unwrap_or_else(|| {
                warn!("TITON_SENSOR_ENTITIES unusable, using built-in sensor list");
                default_sensor_entities()
            }),
            Err(_) => default_sensor_entities(),
        };
        info!(port = %serial_port, settings = %settings_path.display(), sensors = sensors.len(), "runtime configuration resolved");
        Self { serial_port, settings_path, log_path, sensors }
    }

    pub fn settings_store(&self) -> SettingsStore {
        SettingsStore::new(self.settings_path.clone(), self.sensors.clone())
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return Path::new(&xdg).join("titon-controller").join("settings.json");
    }
    if let Ok(home) = env::var("HOME") {
        return Path::new(&home)
            .join(".config")
            .join("titon-controller")
            .join("settings.json");
    }
    PathBuf::from("/etc/titon-controller/settings.json")
}
