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

//! Serial transport for the Titon RS-232 link.
//!
//! The link is opened fresh for every transaction and closed on drop. The
//! device chatters unsolicited on the bus, so writes to speed and inhibit
//! registers are gated behind a quiet period.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ControllerError, Result};

pub const BAUD_RATE: u32 = 1200;
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Bytes requested by a bounded read when nothing is pending yet.
const FALLBACK_READ_LEN: usize = 32;

/// Delays used by the transport and the command layer above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Pause after clearing buffers, before writing.
    pub settle: Duration,
    /// Wait between writing a frame and reading the reply.
    pub response_wait: Duration,
    /// Wait after each write of the remote-control claim.
    pub claim_wait: Duration,
    /// Backoff between command attempts.
    pub retry_backoff: Duration,
    /// Pause between steps of a level sequence.
    pub step_delay: Duration,
    /// Silence required before a gated write.
    pub quiet_required: Duration,
    /// Upper bound on quiet-period gating.
    pub quiet_max_wait: Duration,
    pub quiet_poll: Duration,
}

impl Timing {
    pub const fn device() -> Self {
        Self {
            settle: Duration::from_millis(100),
            response_wait: Duration::from_millis(500),
            claim_wait: Duration::from_millis(300),
            retry_backoff: Duration::from_secs(1),
            step_delay: Duration::from_millis(200),
            quiet_required: Duration::from_secs(2),
            quiet_max_wait: Duration::from_secs(10),
            quiet_poll: Duration::from_millis(100),
        }
    }

    /// No delays at all. Quiet gating gives up immediately.
    pub const fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            response_wait: Duration::ZERO,
            claim_wait: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            step_delay: Duration::ZERO,
            quiet_required: Duration::ZERO,
            quiet_max_wait: Duration::ZERO,
            quiet_poll: Duration::ZERO,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::device()
    }
}

/// An open serial link. Dropping it closes the port.
pub trait Link: Send {
    /// Bytes waiting in the input buffer.
    fn bytes_to_read(&mut self) -> Result<usize>;
    /// Read into `buf`; a read timeout yields `Ok(0)`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn clear_input(&mut self) -> Result<()>;
    fn clear_all(&mut self) -> Result<()>;
}

/// Opens links on demand.
pub trait Connector: Send + Sync {
    fn open(&self) -> Result<Box<dyn Link>>;
    fn describe(&self) -> String;
}

/// Production connector backed by the `serialport` crate.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud: BAUD_RATE,
            timeout: READ_TIMEOUT,
        }
    }
}

impl Connector for SerialConnector {
    fn open(&self) -> Result<Box<dyn Link>> {
        let port = serialport::new(&self.port, self.baud)
            .timeout(self.timeout)
            .open()
            .map_err(|source| ControllerError::SerialOpen {
                port: self.port.clone(),
                source,
            })?;
        Ok(Box::new(SerialLink { port }))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baud)
    }
}

struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl Link for SerialLink {
    fn bytes_to_read(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        Ok(self.port.write_all(data)?)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.port.flush()?)
    }

    fn clear_input(&mut self) -> Result<()> {
        Ok(self.port.clear(serialport::ClearBuffer::Input)?)
    }

    fn clear_all(&mut self) -> Result<()> {
        Ok(self.port.clear(serialport::ClearBuffer::All)?)
    }
}

/// Serialises every open-use-close sequence on the physical link.
pub struct Transport {
    connector: Box<dyn Connector>,
    timing: Timing,
    bus: Mutex<()>,
}

impl Transport {
    pub fn new(connector: Box<dyn Connector>, timing: Timing) -> Self {
        Self {
            connector,
            timing,
            bus: Mutex::new(()),
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// Write one frame and return whatever the device sent back.
    pub fn exchange(&self, frame: &[u8], quiet_gate: bool) -> Result<Vec<u8>> {
        let _bus = self.bus.lock();
        let mut link = self.connector.open()?;
        if quiet_gate {
            wait_for_quiet(link.as_mut(), &self.timing)?;
        }
        link.clear_all()?;
        pause(self.timing.settle);
        link.write_all(frame)?;
        link.flush()?;
        debug!(frame = %String::from_utf8_lossy(frame).trim_end(), "frame sent");
        pause(self.timing.response_wait);
        read_available(link.as_mut())
    }

    /// Send a read probe. Only the input side is cleared and there is no settle pause.
    pub fn probe(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let _bus = self.bus.lock();
        let mut link = self.connector.open()?;
        link.clear_input()?;
        link.write_all(frame)?;
        link.flush()?;
        pause(self.timing.response_wait);
        read_available(link.as_mut())
    }

    /// Write several frames in one transaction without reading replies.
    pub fn write_batch(&self, frames: &[Vec<u8>]) -> Result<()> {
        let _bus = self.bus.lock();
        let mut link = self.connector.open()?;
        for frame in frames {
            link.clear_all()?;
            pause(self.timing.settle);
            link.write_all(frame)?;
            link.flush()?;
            pause(self.timing.claim_wait);
        }
        Ok(())
    }
}

/// Drain unsolicited traffic until the line has been silent for
/// `quiet_required`. Returns `Ok(false)` when `quiet_max_wait` ran out first;
/// callers proceed either way.
pub fn wait_for_quiet(link: &mut dyn Link, timing: &Timing) -> Result<bool> {
    let start = Instant::now();
    let mut quiet = Duration::ZERO;
    let mut drained = 0usize;
    while start.elapsed() < timing.quiet_max_wait {
        let pending = link.bytes_to_read()?;
        if pending > 0 {
            let mut sink = vec![0u8; pending];
            drained += link.read(&mut sink)?;
            quiet = Duration::ZERO;
        } else {
            quiet += timing.quiet_poll;
            if quiet >= timing.quiet_required {
                if drained > 0 {
                    debug!(drained, "bus quiet after discarding unsolicited bytes");
                }
                return Ok(true);
            }
        }
        pause(timing.quiet_poll);
    }
    debug!(drained, waited_ms = start.elapsed().as_millis() as u64, "quiet period not reached, proceeding");
    Ok(false)
}

fn read_available(link: &mut dyn Link) -> Result<Vec<u8>> {
    let pending = link.bytes_to_read()?;
    let mut buf = vec![0u8; if pending > 0 { pending } else { FALLBACK_READ_LEN }];
    let n = link.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

fn pause(d: Duration) {
    if !d.is_zero() {
        thread::sleep(d);
    }
}
