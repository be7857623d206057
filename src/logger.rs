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

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Entries retained in memory for the log tail.
pub const LOG_CAPACITY: usize = 500;

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    System,
    Control,
    Mode,
    Auto,
    Settings,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
    pub meta: Value,
}

/// Operator-facing event log: a bounded newest-first ring plus a JSONL file sink.
///
/// Appending never fails. A sink that cannot be opened or written is skipped
/// silently so a full disk cannot stall the control loop.
pub struct EventLog {
    ring: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    sink: Option<PathBuf>,
}

impl EventLog {
    pub fn new(sink: Option<PathBuf>) -> Self {
        Self::with_capacity(sink, LOG_CAPACITY)
    }

    pub fn with_capacity(sink: Option<PathBuf>, capacity: usize) -> Self {
        if let Some(parent) = sink.as_deref().and_then(Path::parent) {
            let _ = fs::create_dir_all(parent);
        }
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(LOG_CAPACITY))),
            capacity: capacity.max(1),
            sink,
        }
    }

    /// In-memory only; used by tests and one-shot CLI commands.
    pub fn detached() -> Self {
        Self::new(None)
    }

    pub fn append(&self, kind: LogKind, message: impl Into<String>, meta: Value) {
        let entry = LogEntry {
            ts: Utc::now(),
            kind,
            message: message.into(),
            meta: if meta.is_null() { json!({}) } else { meta },
        };

        match kind {
            LogKind::Error => tracing::warn!(kind = ?kind, meta = %entry.meta, "{}", entry.message),
            _ => tracing::info!(kind = ?kind, meta = %entry.meta, "{}", entry.message),
        }

        let line = serde_json::to_string(&entry).ok();
        {
            let mut ring = self.ring.lock();
            ring.push_front(entry);
            ring.truncate(self.capacity);
        }
        if let (Some(path), Some(line)) = (self.sink.as_deref(), line) {
            write_line(path, &line);
        }
    }

    pub fn log(&self, kind: LogKind, message: impl Into<String>) {
        self.append(kind, message, Value::Null);
    }

    /// Newest entries first.
    pub fn tail(&self, limit: usize) -> Vec<LogEntry> {
        self.ring.lock().iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn sink_path(&self) -> Option<&Path> {
        self.sink.as_deref()
    }
}

fn write_line(path: &Path, line: &str) {
    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(f, "{}", line);
    }
}

/// Install the global tracing subscriber. `level` is an `EnvFilter` directive.
pub fn init_tracing(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .try_init();
}
