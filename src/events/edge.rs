use crate::config::EdgeDetect;
use crate::error::EventError;
use crate::gpio::{Channel, GpioBackend};

/// Writes the edge mode of a channel. Failures are returned as-is; retrying is up to the caller.
pub fn configure_edge<B: GpioBackend + ?Sized>(
    backend: &B,
    channel: &Channel,
    edge: EdgeDetect,
    allow_none: bool,
) -> Result<(), EventError> {
    if !allow_none && !edge.is_active() {
        return Err(EventError::UnallowedEdgeNone);
    }
    backend.write_edge(channel, edge)
}
