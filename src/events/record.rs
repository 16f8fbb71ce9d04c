use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EdgeDetect;
use crate::error::EventError;
use crate::gpio::Channel;

use super::callback::Callback;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    None,
    Add,
    InitialDiscard, // next readiness report is stale
    Remove,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassAction {
    Nothing,
    Register,
    Release,
}

impl Marker {
    /// Records only a blocking waiter uses stay unregistered; removal waits for the waiter.
    pub fn on_pass(self, blocking: bool, concurrent: bool) -> (Marker, PassAction) {
        match self {
            Marker::None => (Marker::None, PassAction::Nothing),
            Marker::Add if concurrent => (Marker::InitialDiscard, PassAction::Register),
            Marker::Add => (Marker::Add, PassAction::Nothing),
            Marker::InitialDiscard | Marker::Modify => (Marker::None, PassAction::Nothing),
            Marker::Remove if blocking => (Marker::Remove, PassAction::Nothing),
            Marker::Remove => (Marker::Remove, PassAction::Release),
        }
    }

    pub fn on_reuse(self) -> Marker {
        match self {
            Marker::Remove => Marker::Modify,
            other => other,
        }
    }

    pub fn delivers(self) -> bool {
        self == Marker::None
    }
}

#[derive(Debug)]
pub struct ChannelEventRecord {
    pub channel: Channel,
    pub fd: Arc<OwnedFd>,
    pub edge: EdgeDetect,
    pub debounce_ms: u64,
    pub last_event: Option<Instant>,
    pub occurred: bool,
    pub callbacks: Vec<Callback>,
    pub blocking_in_progress: bool,
    pub concurrently_registered: bool,
    pub marker: Marker,
    pub registered_by: Option<u64>, // poller generation holding the descriptor
}

impl ChannelEventRecord {
    pub fn new(channel: Channel, fd: OwnedFd, edge: EdgeDetect, debounce_ms: u64) -> Self {
        Self {
            channel,
            fd: Arc::new(fd),
            edge,
            debounce_ms,
            last_event: None,
            occurred: false,
            callbacks: Vec::new(),
            blocking_in_progress: false,
            concurrently_registered: false,
            marker: Marker::Add,
            registered_by: None,
        }
    }

    pub fn in_use(&self) -> bool {
        self.blocking_in_progress || self.concurrently_registered
    }

    pub fn check_agreement(&self, edge: EdgeDetect, debounce_ms: u64) -> Result<(), EventError> {
        if self.edge != edge {
            return Err(EventError::ConflictingEdgeType(self.channel.id.clone()));
        }
        if debounce_ms != 0 && self.debounce_ms != debounce_ms {
            return Err(EventError::ConflictingBounceTime(self.channel.id.clone()));
        }
        Ok(())
    }

    pub fn quiet_until(&self) -> Option<Instant> {
        if self.debounce_ms == 0 {
            return None;
        }
        self.last_event
            .map(|t| t + Duration::from_millis(self.debounce_ms))
    }

    pub fn debounce_elapsed(&self, now: Instant) -> bool {
        self.quiet_until().is_none_or(|t| now >= t)
    }

    pub fn reset_session(&mut self, debounce_ms: u64) {
        self.debounce_ms = debounce_ms;
        self.last_event = None;
        self.occurred = false;
        self.marker = self.marker.on_reuse();
    }
}
