use std::io;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

/// Failures of the edge-event engine and the collaborators it drives.
///
/// Every variant maps to a stable negative code, see [`EventError::code`].
#[derive(Debug, Error)]
pub enum EventError {
    #[error("failed to open edge file {path}: {source}")]
    EdgeOpen { path: String, source: io::Error },
    #[error("specifying edge as 'none' is not allowed")]
    UnallowedEdgeNone,
    #[error("illegal edge argument: {0}")]
    IllegalEdgeArgument(String),
    #[error("failed to write edge file {path}: {source}")]
    EdgeWrite { path: String, source: io::Error },
    #[error("failed to open value file {path}: {source}")]
    ValueOpen { path: String, source: io::Error },
    #[error("failed to set value file {path} non-blocking: {source}")]
    ValueNonBlocking { path: String, source: io::Error },
    #[error("channel {0} is already blocked by a concurrent wait_for_edge call")]
    ChannelAlreadyBlocked(String),
    #[error("channel {0} is currently detecting a different edge type")]
    ConflictingEdgeType(String),
    #[error("channel {0} is currently employing a different bounce time")]
    ConflictingBounceTime(String),
    #[error("internal event tracking error on line {0}")]
    InternalTrackingError(u32),
    #[error("failed to create readiness poller: {0}")]
    PollCreate(#[source] io::Error),
    #[error("failed to register descriptor with readiness poller: {0}")]
    PollRegister(#[source] io::Error),
    #[error("readiness wait failed: {0}")]
    PollWait(#[source] io::Error),
    #[error("no event detection on channel {0}, call add_event_detect first")]
    EventNotFound(String),
}

impl EventError {
    pub fn code(&self) -> i32 {
        match self {
            EventError::EdgeOpen { .. } => -100,
            EventError::UnallowedEdgeNone => -101,
            EventError::IllegalEdgeArgument(_) => -102,
            EventError::EdgeWrite { .. } => -103,
            EventError::ValueOpen { .. } => -104,
            EventError::ValueNonBlocking { .. } => -105,
            EventError::ChannelAlreadyBlocked(_) => -106,
            EventError::ConflictingEdgeType(_) => -107,
            EventError::ConflictingBounceTime(_) => -108,
            EventError::InternalTrackingError(_) => -109,
            EventError::PollCreate(_) => -110,
            EventError::PollRegister(_) => -111,
            EventError::PollWait(_) => -112,
            EventError::EventNotFound(_) => -113,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Channel not found: {0}")]
    NotFoundChannel(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
    #[error(transparent)]
    Event(#[from] EventError),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFoundChannel(_) => StatusCode::NOT_FOUND,
            AppError::InvalidValue(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_) | AppError::Gpio(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Event(e) => match e {
                EventError::EventNotFound(_) => StatusCode::NOT_FOUND,
                EventError::UnallowedEdgeNone | EventError::IllegalEdgeArgument(_) => {
                    StatusCode::BAD_REQUEST
                }
                EventError::ChannelAlreadyBlocked(_)
                | EventError::ConflictingEdgeType(_)
                | EventError::ConflictingBounceTime(_) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            AppError::Event(e) => json!({ "error": self.to_string(), "code": e.code() }),
            _ => json!({ "error": self.to_string() }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}
