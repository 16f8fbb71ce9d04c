use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{trace, warn};
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use serde::Serialize;

use crate::config::EdgeDetect;
use crate::error::EventError;
use crate::gpio::{Channel, GpioBackend};

use super::poller::PollerHandle;
use super::{EventRegistry, RegistryState, configure_edge, value_interest};

const WAIT_TOKEN: Token = Token(0);
const INITIAL_READINESS_WINDOW: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitOutcome {
    pub channel: String,
    pub detected: bool,
}

impl WaitOutcome {
    /// `1` when an edge was detected, `0` on timeout.
    pub fn code(&self) -> i32 {
        i32::from(self.detected)
    }
}

struct BlockingClaim<'a, B: GpioBackend + 'static> {
    registry: &'a EventRegistry<B>,
    line: u32,
}

impl<B: GpioBackend + 'static> Drop for BlockingClaim<'_, B> {
    fn drop(&mut self) {
        let idle = self.registry.release_blocking(self.line);
        drop(idle);
    }
}

impl<B: GpioBackend + 'static> EventRegistry<B> {
    /// Blocks until `edge` occurs on the channel or `timeout_ms` elapses (0 waits forever).
    ///
    /// At most one blocking wait may run per channel; a second one fails with
    /// [`EventError::ChannelAlreadyBlocked`] without touching the channel.
    pub fn wait_for_edge(
        &self,
        channel: &Channel,
        edge: EdgeDetect,
        debounce_ms: u64,
        timeout_ms: u64,
    ) -> Result<WaitOutcome, EventError> {
        if !edge.is_active() {
            return Err(EventError::UnallowedEdgeNone);
        }

        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));

        let (fd, quiet_until) = self.claim_blocking(channel, edge, debounce_ms)?;
        let _claim = BlockingClaim {
            registry: self,
            line: channel.line,
        };

        let detected = await_edge(&fd, deadline, quiet_until)?;
        trace!(
            "wait on channel {} ended, detected: {detected}",
            channel.id
        );

        Ok(WaitOutcome {
            channel: channel.id.clone(),
            detected,
        })
    }

    fn claim_blocking(
        &self,
        channel: &Channel,
        edge: EdgeDetect,
        debounce_ms: u64,
    ) -> Result<(Arc<OwnedFd>, Option<Instant>), EventError> {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        let backend = &*self.shared.backend;

        match state.records.get_mut(&channel.line) {
            Some(record) => {
                if record.blocking_in_progress {
                    return Err(EventError::ChannelAlreadyBlocked(channel.id.clone()));
                }
                if record.concurrently_registered {
                    record.check_agreement(edge, debounce_ms)?;
                } else {
                    // removed detection the poller has not reclaimed yet
                    if record.edge != edge {
                        configure_edge(backend, channel, edge, false)?;
                        record.edge = edge;
                    }
                    record.reset_session(debounce_ms);
                }
                record.blocking_in_progress = true;
                Ok((record.fd.clone(), record.quiet_until()))
            }
            None => {
                let mut record = RegistryState::open_record(backend, channel, edge, debounce_ms)?;
                record.blocking_in_progress = true;
                let fd = record.fd.clone();
                state.records.insert(channel.line, record);
                Ok((fd, None))
            }
        }
    }

    fn release_blocking(&self, line: u32) -> Option<PollerHandle> {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();

        let Some(record) = state.records.get_mut(&line) else {
            warn!("{}", EventError::InternalTrackingError(line));
            return None;
        };
        record.blocking_in_progress = false;

        if record.concurrently_registered {
            None
        } else if record.registered_by.is_none() {
            // never handed to the poller, close it here
            state.records.remove(&line);
            state.take_idle_poller()
        } else {
            state.mark_remove(line)
        }
    }
}

// never touches the record, a poller sharing the descriptor still sees every edge
fn await_edge(
    fd: &OwnedFd,
    deadline: Option<Instant>,
    quiet_until: Option<Instant>,
) -> Result<bool, EventError> {
    let mut poll = Poll::new().map_err(EventError::PollCreate)?;
    let raw = fd.as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&raw), WAIT_TOKEN, value_interest())
        .map_err(EventError::PollRegister)?;
    let mut events = Events::with_capacity(1);

    // the first report reflects the level the line already had
    poll_ready(&mut poll, &mut events, Some(INITIAL_READINESS_WINDOW))?;

    loop {
        let timeout = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                Some(deadline - now)
            }
            None => None,
        };

        if poll_ready(&mut poll, &mut events, timeout)?
            && quiet_until.is_none_or(|t| Instant::now() >= t)
        {
            return Ok(true);
        }
    }
}

fn poll_ready(
    poll: &mut Poll,
    events: &mut Events,
    timeout: Option<Duration>,
) -> Result<bool, EventError> {
    match poll.poll(events, timeout) {
        Ok(()) => Ok(events.iter().any(|event| event.token() == WAIT_TOKEN)),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
        Err(e) => Err(EventError::PollWait(e)),
    }
}
