//! Edge-event engine: one registry behind a reentrant lock, a lazily started
//! background poller, and blocking waits sharing the same records.

mod callback;
mod edge;
mod poller;
mod record;
mod wait;

use std::cell::RefCell;
use std::sync::Arc;

use log::debug;
use mio::Interest;
use parking_lot::ReentrantMutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::config::EdgeDetect;
use crate::error::EventError;
use crate::gpio::{Channel, GpioBackend};

pub use callback::Callback;
pub use edge::configure_edge;
pub use wait::WaitOutcome;

use poller::PollerHandle;
use record::{ChannelEventRecord, Marker};

// sysfs value files signal edges as priority data
fn value_interest() -> Interest {
    Interest::READABLE.add(Interest::PRIORITY)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventStatus {
    pub edge: EdgeDetect,
    pub debounce_ms: u64,
    pub detecting: bool,
    pub blocking: bool,
    pub callbacks: usize,
}

struct Shared<B: GpioBackend> {
    backend: Arc<B>,
    state: ReentrantMutex<RefCell<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    records: FxHashMap<u32, ChannelEventRecord>, // keyed by line
    poller: Option<PollerHandle>,
    generation: u64,
}

impl RegistryState {
    fn open_record<B: GpioBackend + ?Sized>(
        backend: &B,
        channel: &Channel,
        edge: EdgeDetect,
        debounce_ms: u64,
    ) -> Result<ChannelEventRecord, EventError> {
        let fd = backend.open_value(channel)?;
        // the descriptor closes on drop if the edge cannot be configured
        configure_edge(backend, channel, edge, false)?;
        Ok(ChannelEventRecord::new(channel.clone(), fd, edge, debounce_ms))
    }

    fn add_or_reuse<B: GpioBackend + ?Sized>(
        &mut self,
        backend: &B,
        channel: &Channel,
        edge: EdgeDetect,
        debounce_ms: u64,
    ) -> Result<(), EventError> {
        match self.records.get_mut(&channel.line) {
            Some(record) => {
                if record.in_use() {
                    record.check_agreement(edge, debounce_ms)?;
                    record.marker = record.marker.on_reuse();
                } else {
                    // left behind by a removed detection the poller has not reclaimed yet
                    if record.edge != edge {
                        configure_edge(backend, channel, edge, false)?;
                        record.edge = edge;
                    }
                    record.reset_session(debounce_ms);
                }
                record.concurrently_registered = true;
            }
            None => {
                let mut record = Self::open_record(backend, channel, edge, debounce_ms)?;
                record.concurrently_registered = true;
                self.records.insert(channel.line, record);
            }
        }
        Ok(())
    }

    fn mark_remove(&mut self, line: u32) -> Option<PollerHandle> {
        let record = self.records.get_mut(&line)?;
        record.concurrently_registered = false;
        record.callbacks.clear();

        if record.registered_by.is_some() {
            record.marker = Marker::Remove;
        } else if !record.blocking_in_progress {
            self.records.remove(&line);
        }

        self.take_idle_poller()
    }

    fn take_idle_poller(&mut self) -> Option<PollerHandle> {
        if self.records.values().any(ChannelEventRecord::in_use) {
            return None;
        }
        self.poller.take()
    }

    fn query_and_clear_occurred(&mut self, line: u32) -> bool {
        self.records
            .get_mut(&line)
            .map(|record| std::mem::take(&mut record.occurred))
            .unwrap_or(false)
    }
}

/// Dropping the registry stops the poller and closes every descriptor.
pub struct EventRegistry<B: GpioBackend + 'static> {
    shared: Arc<Shared<B>>,
}

impl<B: GpioBackend + 'static> EventRegistry<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                state: ReentrantMutex::new(RefCell::new(RegistryState::default())),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.shared.backend
    }

    pub fn add_event_detect(
        &self,
        channel: &Channel,
        edge: EdgeDetect,
        callback: Option<Callback>,
        debounce_ms: u64,
    ) -> Result<(), EventError> {
        if !edge.is_active() {
            return Err(EventError::UnallowedEdgeNone);
        }

        let guard = self.shared.state.lock();
        let needs_poller = {
            let mut state = guard.borrow_mut();
            state.add_or_reuse(&*self.shared.backend, channel, edge, debounce_ms)?;
            if let Some(callback) = callback
                && let Some(record) = state.records.get_mut(&channel.line)
            {
                record.callbacks.push(callback);
            }
            state.poller.is_none()
        };

        if needs_poller && let Err(e) = poller::spawn(&self.shared, &guard) {
            let idle = guard.borrow_mut().mark_remove(channel.line);
            drop(guard);
            drop(idle);
            return Err(e);
        }

        debug!("edge detection {edge} on channel {}", channel.id);
        Ok(())
    }

    /// Stops callback delivery immediately; the descriptor is reclaimed once no waiter holds it.
    pub fn remove_event_detect(&self, channel: &Channel) {
        let idle = {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            state.mark_remove(channel.line)
        };
        drop(idle);
    }

    pub fn add_event_callback(
        &self,
        channel: &Channel,
        callback: Callback,
    ) -> Result<(), EventError> {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();

        match state.records.get_mut(&channel.line) {
            Some(record) if record.concurrently_registered => {
                record.callbacks.push(callback);
                Ok(())
            }
            _ => Err(EventError::EventNotFound(channel.id.clone())),
        }
    }

    pub fn remove_event_callback(&self, channel: &Channel, callback: &Callback) {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();

        if let Some(record) = state.records.get_mut(&channel.line) {
            record.callbacks.retain(|c| c != callback);
        }
    }

    /// Whether an edge was delivered since the last call. Clears the flag.
    pub fn event_detected(&self, channel: &Channel) -> bool {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        state.query_and_clear_occurred(channel.line)
    }

    pub fn status(&self, channel: &Channel) -> Option<EventStatus> {
        let guard = self.shared.state.lock();
        let state = guard.borrow();

        state.records.get(&channel.line).map(|record| EventStatus {
            edge: record.edge,
            debounce_ms: record.debounce_ms,
            detecting: record.concurrently_registered,
            blocking: record.blocking_in_progress,
            callbacks: record.callbacks.len(),
        })
    }

    pub fn tracked_lines(&self) -> Vec<u32> {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        let mut lines: Vec<u32> = state.records.keys().copied().collect();
        lines.sort_unstable();
        lines
    }

    pub fn poller_running(&self) -> bool {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        state.poller.is_some()
    }

    /// Stops the poller and drops every registration not held by a blocking waiter.
    pub fn shutdown(&self) {
        let poller = {
            let guard = self.shared.state.lock();
            let mut state = guard.borrow_mut();
            state.poller.take()
        };
        // joins outside the lock; the poller needs it to finish its pass
        drop(poller);

        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        state.records.retain(|_, record| {
            record.concurrently_registered = false;
            record.callbacks.clear();
            record.blocking_in_progress
        });
    }
}

impl<B: GpioBackend + 'static> Drop for EventRegistry<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
