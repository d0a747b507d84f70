//! Error taxonomy for the controller core.
//!
//! The resource store and message bus surface their own errors
//! unchanged ([`StoreError`], [`BusError`]); the connection manager
//! translates everything it orchestrates into [`ControllerError`] and
//! compensates for partial side effects before returning one.

use thiserror::Error;

use crate::bus::BusError;
use crate::domain::{ConnectionEvent, ConnectionStatus, PopId};
use crate::store::StoreError;

/// Errors surfaced by controller operations.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The caller's input is malformed or self-contradictory.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A referenced POP, connection, or link does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A requested interface or slot is currently held by someone else.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The topology contains no route between the endpoints.
    #[error("no path from {from} to {destination}")]
    NoPath { from: PopId, destination: PopId },

    /// No contiguous spectrum run satisfies the request on every link.
    #[error("no spectrum available: {0}")]
    NoSpectrum(String),

    /// The requested event is not legal in the connection's state.
    #[error("illegal transition: {event:?} in state {status:?}")]
    FsmReject {
        status: ConnectionStatus,
        event: ConnectionEvent,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ControllerError>;
