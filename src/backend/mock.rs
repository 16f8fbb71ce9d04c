use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::EdgeDetect;
use crate::error::{AppError, EventError};
use crate::gpio::{Channel, GpioBackend};

/// In-memory lines for tests and hardware-less runs.
///
/// Every value descriptor handed out is one end of a socket pair; the mock
/// keeps the other end and writes a byte to it whenever the line sees an edge
/// matching its configured mode, which makes the descriptor readable.
#[derive(Default)]
pub struct MockGpioBackend {
    lines: Mutex<FxHashMap<u32, MockLine>>, // keyed by line
}

#[derive(Default)]
struct MockLine {
    exported: bool,
    value: u8,
    edge: EdgeDetect,
    opened: usize,
    peers: Vec<UnixStream>,
}

impl MockLine {
    fn signal(&mut self) {
        self.prune_closed();
        for peer in &mut self.peers {
            // a full buffer is still readable
            let _ = peer.write(&[1]);
        }
    }

    /// Drops peers whose descriptor has been closed by the engine.
    fn prune_closed(&mut self) {
        self.peers.retain_mut(|peer| {
            let mut buf = [0u8; 1];
            match peer.read(&mut buf) {
                Ok(0) => false,
                Ok(_) => true,
                Err(e) => e.kind() == io::ErrorKind::WouldBlock,
            }
        });
    }
}

impl MockGpioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drives the line to `value`, signalling open descriptors on a matching edge.
    pub fn set_value(&self, line: u32, value: u8) {
        let mut lines = self.lines.lock();
        let state = lines.entry(line).or_default();

        let old = state.value;
        state.value = value;

        let observed = match (old, value) {
            (0, 1) => Some(EdgeDetect::Rising),
            (1, 0) => Some(EdgeDetect::Falling),
            _ => None,
        };
        if observed.is_some_and(|edge_kind| edge_matches(state.edge, edge_kind)) {
            state.signal();
        }
    }

    /// Toggles the line twice, producing one rising and one falling edge.
    pub fn pulse(&self, line: u32) {
        let current = self.value(line);
        self.set_value(line, 1 - current.min(1));
        self.set_value(line, current.min(1));
    }

    pub fn value(&self, line: u32) -> u8 {
        self.lines.lock().get(&line).map(|l| l.value).unwrap_or(0)
    }

    pub fn edge(&self, line: u32) -> EdgeDetect {
        self.lines
            .lock()
            .get(&line)
            .map(|l| l.edge)
            .unwrap_or_default()
    }

    pub fn is_exported(&self, line: u32) -> bool {
        self.lines.lock().get(&line).is_some_and(|l| l.exported)
    }

    /// How many value descriptors have ever been opened for the line.
    pub fn open_count(&self, line: u32) -> usize {
        self.lines.lock().get(&line).map(|l| l.opened).unwrap_or(0)
    }

    /// How many value descriptors for the line are still open.
    pub fn open_descriptors(&self, line: u32) -> usize {
        let mut lines = self.lines.lock();
        lines
            .get_mut(&line)
            .map(|l| {
                l.prune_closed();
                l.peers.len()
            })
            .unwrap_or(0)
    }
}

impl GpioBackend for MockGpioBackend {
    fn export_input(&self, channel: &Channel) -> Result<(), AppError> {
        self.lines.lock().entry(channel.line).or_default().exported = true;
        Ok(())
    }

    fn unexport(&self, channel: &Channel) -> Result<(), AppError> {
        if let Some(line) = self.lines.lock().get_mut(&channel.line) {
            line.exported = false;
        }
        Ok(())
    }

    fn read_value(&self, channel: &Channel) -> Result<u8, AppError> {
        let lines = self.lines.lock();
        match lines.get(&channel.line) {
            Some(line) if line.exported => Ok(line.value),
            _ => Err(AppError::Gpio(format!(
                "{} is not exported, set it up first",
                channel.gpio_name
            ))),
        }
    }

    fn open_value(&self, channel: &Channel) -> Result<OwnedFd, EventError> {
        let value_open = |source| EventError::ValueOpen {
            path: format!("mock:{}/value", channel.gpio_name),
            source,
        };
        let (reader, mut peer) = UnixStream::pair().map_err(value_open)?;
        peer.set_nonblocking(true).map_err(value_open)?;
        reader
            .set_nonblocking(true)
            .map_err(|source| EventError::ValueNonBlocking {
                path: format!("mock:{}/value", channel.gpio_name),
                source,
            })?;

        // a freshly opened value file reports readiness once
        peer.write_all(&[1]).map_err(value_open)?;

        let mut lines = self.lines.lock();
        let line = lines.entry(channel.line).or_default();
        line.opened += 1;
        line.peers.push(peer);
        Ok(OwnedFd::from(reader))
    }

    fn write_edge(&self, channel: &Channel, edge: EdgeDetect) -> Result<(), EventError> {
        self.lines.lock().entry(channel.line).or_default().edge = edge;
        Ok(())
    }
}

fn edge_matches(configured: EdgeDetect, observed: EdgeDetect) -> bool {
    match configured {
        EdgeDetect::None => false,
        EdgeDetect::Rising => observed == EdgeDetect::Rising,
        EdgeDetect::Falling => observed == EdgeDetect::Falling,
        EdgeDetect::Both => matches!(observed, EdgeDetect::Rising | EdgeDetect::Falling),
    }
}
