// Error types for the Portico connector core

use crate::async_state::AsyncState;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed wire data reported by a codec.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A single multiplexed stream was closed; the connection survives.
    #[error("Stream closed: {0}")]
    StreamClosed(String),

    /// A transition was requested that the async state machine does not define.
    #[error("Illegal async state transition: {operation} in state {state:?}")]
    IllegalState {
        state: AsyncState,
        operation: &'static str,
    },

    #[error("Upgrade error: {0}")]
    Upgrade(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Processor is not bound to a socket")]
    ProcessorClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported action: {0}")]
    UnsupportedAction(&'static str),
}

impl Error {
    /// True for transport failures.
    ///
    /// Transport failures never rewrite the response status since the
    /// client will not see it.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::StreamClosed(_))
    }

    /// True for errors that indicate a programming bug rather than a runtime
    /// condition.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::IllegalState { .. } | Error::UnsupportedAction(_))
    }

    pub(crate) fn illegal(state: AsyncState, operation: &'static str) -> Self {
        Error::IllegalState { state, operation }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
