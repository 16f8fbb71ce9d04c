use std::cell::RefCell;
use std::io;
use std::os::fd::AsRawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};

use crate::error::EventError;
use crate::gpio::GpioBackend;

use super::callback::Callback;
use super::record::{ChannelEventRecord, Marker, PassAction};
use super::{RegistryState, Shared, value_interest};

const POLLER_EVENT_CAPACITY: usize = 20;
const POLLER_WAIT_TIMEOUT: Duration = Duration::from_millis(1);

/// Dropping the handle stops the thread and joins it, unless dropped on the poller thread.
pub(super) struct PollerHandle {
    generation: u64,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("edge poller #{} panicked", self.generation);
            }
        }
    }
}

// caller holds the registry lock
pub(super) fn spawn<B: GpioBackend + 'static>(
    shared: &Arc<Shared<B>>,
    state: &RefCell<RegistryState>,
) -> Result<(), EventError> {
    let poll = Poll::new().map_err(EventError::PollCreate)?;

    let mut state = state.borrow_mut();
    state.generation += 1;
    let generation = state.generation;
    let running = Arc::new(AtomicBool::new(true));

    let poller = Poller {
        shared: shared.clone(),
        poll,
        running: running.clone(),
        generation,
    };
    let thread = thread::Builder::new()
        .name(format!("edge-poller-{generation}"))
        .spawn(move || poller.run())
        .map_err(EventError::PollCreate)?;

    debug!("edge poller #{generation} started");
    state.poller = Some(PollerHandle {
        generation,
        running,
        thread: Some(thread),
    });
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stopped,
    Failed,
}

struct Poller<B: GpioBackend + 'static> {
    shared: Arc<Shared<B>>,
    poll: Poll,
    running: Arc<AtomicBool>,
    generation: u64,
}

impl<B: GpioBackend + 'static> Poller<B> {
    fn run(mut self) {
        let mut events = Events::with_capacity(POLLER_EVENT_CAPACITY);

        let exit = loop {
            if !self.running.load(Ordering::Acquire) {
                break Exit::Stopped;
            }

            if let Err(e) = self.poll.poll(&mut events, Some(POLLER_WAIT_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("edge poller #{}: readiness wait failed: {e}", self.generation);
                    break Exit::Failed;
                }
                events.clear();
            }

            let guard = self.shared.state.lock();
            self.deliver(&guard, &events);
            if let Err(e) = self.reconcile(&guard) {
                error!("edge poller #{}: {e}", self.generation);
                break Exit::Failed;
            }
        };

        self.teardown(exit);
    }

    fn deliver(&self, state: &RefCell<RegistryState>, events: &Events) {
        for event in events.iter() {
            let line = event.token().0 as u32;
            let Some((channel_id, callbacks)) = self.take_delivery(state, line) else {
                continue;
            };

            // callbacks run without a borrow so they can call back into the registry
            for callback in &callbacks {
                if !still_delivering(state, line) {
                    break;
                }
                if catch_unwind(AssertUnwindSafe(|| callback.invoke(&channel_id))).is_err() {
                    error!("edge callback {callback:?} on channel {channel_id} panicked");
                }
            }
        }
    }

    fn take_delivery(
        &self,
        state: &RefCell<RegistryState>,
        line: u32,
    ) -> Option<(String, Vec<Callback>)> {
        let mut state = state.borrow_mut();
        let record = state.records.get_mut(&line)?;

        if record.registered_by != Some(self.generation)
            || !record.concurrently_registered
            || !record.marker.delivers()
        {
            return None;
        }

        let now = Instant::now();
        if !record.debounce_elapsed(now) {
            trace!("edge on channel {} suppressed by debounce", record.channel.id);
            return None;
        }

        record.last_event = Some(now);
        record.occurred = true;
        Some((record.channel.id.clone(), record.callbacks.clone()))
    }

    fn reconcile(&self, state: &RefCell<RegistryState>) -> Result<(), EventError> {
        let mut state = state.borrow_mut();
        let accepting = self.running.load(Ordering::Acquire);
        let mut released = Vec::new();

        for (line, record) in state.records.iter_mut() {
            let (marker, action) =
                record
                    .marker
                    .on_pass(record.blocking_in_progress, record.concurrently_registered);
            match action {
                PassAction::Nothing => record.marker = marker,
                PassAction::Register => {
                    // a stopping poller leaves new registrations to its successor
                    if !accepting {
                        continue;
                    }
                    self.register(*line, record)?;
                    record.registered_by = Some(self.generation);
                    record.marker = marker;
                }
                PassAction::Release => {
                    if record.registered_by.is_none_or(|g| g == self.generation) {
                        released.push(*line);
                    }
                }
            }
        }

        for line in released {
            if let Some(record) = state.records.remove(&line) {
                self.deregister(&record);
                debug!("released event descriptor of channel {}", record.channel.id);
            }
        }
        Ok(())
    }

    fn register(&self, line: u32, record: &ChannelEventRecord) -> Result<(), EventError> {
        let fd = record.fd.as_raw_fd();
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(line as usize), value_interest())
            .map_err(EventError::PollRegister)
    }

    fn deregister(&self, record: &ChannelEventRecord) {
        if record.registered_by != Some(self.generation) {
            return;
        }
        let fd = record.fd.as_raw_fd();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            warn!(
                "failed to deregister channel {} from edge poller: {e}",
                record.channel.id
            );
        }
    }

    fn teardown(self, exit: Exit) {
        let guard = self.shared.state.lock();
        let own_handle = {
            let mut state = guard.borrow_mut();
            let current = state
                .poller
                .as_ref()
                .is_some_and(|p| p.generation == self.generation);
            let purge = exit == Exit::Failed && current;
            let own_handle = if purge { state.poller.take() } else { None };
            if purge {
                error!(
                    "edge poller #{} failed, dropping all event detections",
                    self.generation
                );
            }

            let lines: Vec<u32> = state.records.keys().copied().collect();
            for line in lines {
                let Some(record) = state.records.get_mut(&line) else {
                    continue;
                };

                let mine = record.registered_by == Some(self.generation);
                if mine {
                    self.deregister(record);
                    record.registered_by = None;
                    record.marker = Marker::Add;
                }
                if purge {
                    record.concurrently_registered = false;
                    record.callbacks.clear();
                }
                if (mine || purge) && !record.in_use() {
                    state.records.remove(&line);
                }
            }
            own_handle
        };
        drop(guard);
        drop(own_handle);

        debug!("edge poller #{} stopped ({exit:?})", self.generation);
    }
}

fn still_delivering(state: &RefCell<RegistryState>, line: u32) -> bool {
    state
        .borrow()
        .records
        .get(&line)
        .is_some_and(|record| record.concurrently_registered && record.marker.delivers())
}
