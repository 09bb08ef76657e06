use thiserror::Error;

use crate::sink::SinkError;
use crate::transport::TransportError;
use crate::types::ConnectionState;

/// Errors surfaced at the session-manager / multiplexer call boundary.
///
/// `InvalidIdentity` and `InvalidState` are rejected synchronously and mutate
/// nothing. `Transport` failures during connect or streaming are reported
/// asynchronously through [`crate::types::CoreEvent`] and revert the affected
/// state; they are never fatal to the process. `Sink` failures are isolated
/// per measurement and never stop a subscription.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The device id is empty or not plain ASCII alphanumeric.
    #[error("invalid device identity {0:?}")]
    InvalidIdentity(String),

    /// The operation is not legal in the current connection state, e.g.
    /// `connect` while already `Connecting`, or `start` on a kind that is
    /// already live.
    #[error("{op} is not valid while {state}")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },

    /// A stream start was attempted without an active session.
    #[error("no device session is connected")]
    NotConnected,

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("sink: {0}")]
    Sink(#[from] SinkError),
}
