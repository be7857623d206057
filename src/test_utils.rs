/*
 * Test utilities and fakes for Titon Controller
 *
 * This module provides a scripted stand-in for the serial bus plus helpers
 * shared by the unit tests of the transport, protocol, device and service
 * modules.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ControllerError, Result};
use crate::serial::{Connector, Link};

/// How the fake device answers a written frame.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Send the frame straight back.
    Echo,
    /// Send nothing.
    Silent,
    /// Send a fixed string.
    Text(String),
}

#[derive(Default)]
struct BusState {
    default_reply: Option<Reply>,
    scripted: VecDeque<Reply>,
    reads: HashMap<String, String>,
    written: Vec<String>,
    unsolicited: Vec<u8>,
    chatter: bool,
    opens: usize,
    open_links: usize,
    failing_opens: usize,
}

/// A fake serial bus. Cloning shares the same device.
#[derive(Clone)]
pub struct FakeBus {
    state: Arc<Mutex<BusState>>,
}

impl FakeBus {
    pub fn new(default_reply: Reply) -> Self {
        let state = BusState {
            default_reply: Some(default_reply),
            ..BusState::default()
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(FakeConnector { bus: self.clone() })
    }

    /// Replies consumed one per written frame before falling back to the default.
    pub fn script(&self, replies: Vec<Reply>) {
        self.state.lock().scripted.extend(replies);
    }

    /// Answer read probes for `register` with `text`.
    pub fn respond_to_read(&self, register: &str, text: &str) {
        self.state.lock().reads.insert(register.to_string(), text.to_string());
    }

    pub fn push_unsolicited(&self, bytes: &[u8]) {
        self.state.lock().unsolicited.extend_from_slice(bytes);
    }

    pub fn set_chatter(&self, on: bool) {
        self.state.lock().chatter = on;
    }

    pub fn fail_opens(&self, n: usize) {
        self.state.lock().failing_opens = n;
    }

    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// Written write-frames only, as `(register, value)`.
    pub fn writes(&self) -> Vec<(String, u32)> {
        self.written()
            .iter()
            .filter(|f| f.as_bytes().get(3) == Some(&b'0'))
            .filter_map(|f| Some((f.get(0..3)?.to_string(), f.get(5..10)?.parse().ok()?)))
            .collect()
    }

    pub fn clear_written(&self) {
        self.state.lock().written.clear();
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn open_links(&self) -> usize {
        self.state.lock().open_links
    }
}

struct FakeConnector {
    bus: FakeBus,
}

impl Connector for FakeConnector {
    fn open(&self) -> Result<Box<dyn Link>> {
        let mut state = self.bus.state.lock();
        state.opens += 1;
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(ControllerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "fake port unavailable",
            )));
        }
        state.open_links += 1;
        let input: VecDeque<u8> = state.unsolicited.drain(..).collect();
        Ok(Box::new(FakeLink { bus: self.bus.clone(), input }))
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

struct FakeLink {
    bus: FakeBus,
    input: VecDeque<u8>,
}

impl Drop for FakeLink {
    fn drop(&mut self) {
        self.bus.state.lock().open_links -= 1;
    }
}

impl Link for FakeLink {
    fn bytes_to_read(&mut self) -> Result<usize> {
        if self.bus.state.lock().chatter {
            return Ok(1);
        }
        Ok(self.input.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.bus.state.lock().chatter {
            if let Some(b) = buf.first_mut() {
                *b = b'0';
                return Ok(1);
            }
            return Ok(0);
        }
        let n = buf.len().min(self.input.len());
        for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let frame = String::from_utf8_lossy(data).to_string();
        let mut state = self.bus.state.lock();
        state.written.push(frame.clone());
        let is_read = data.get(3) == Some(&b'1');
        let read_reply = if is_read {
            frame.get(0..3).and_then(|reg| state.reads.get(reg)).cloned()
        } else {
            None
        };
        let reply = match read_reply {
            Some(text) => Reply::Text(text),
            None => match state.scripted.pop_front() {
                Some(r) => r,
                None => state.default_reply.clone().unwrap_or(Reply::Silent),
            },
        };
        match reply {
            Reply::Echo => self.input.extend(data.iter().copied()),
            Reply::Silent => {}
            Reply::Text(text) => self.input.extend(text.bytes()),
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.input.clear();
        Ok(())
    }

    fn clear_all(&mut self) -> Result<()> {
        self.input.clear();
        Ok(())
    }
}
