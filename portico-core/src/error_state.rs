//! Error severity for an in-flight request.
//!
//! Every error reported while a request is being processed is folded into a
//! single [`ErrorState`] by taking the most severe value seen. The severity
//! decides how much of the connection has to be abandoned:
//!
//! ```text
//! None < CloseClean < CloseNow < CloseConnectionNow
//!  │        │            │              │
//!  │        │            │              └─ whole connection, no more I/O
//!  │        │            └─ this stream only, no more request I/O
//!  │        └─ finish the response, then close
//!  └─ no error
//! ```
//!
//! `CloseNow` and `CloseConnectionNow` are distinct so that multiplexed
//! protocols can drop a single stream while the transport keeps serving the
//! others.

/// Severity of the error state of a request, as a single byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ErrorState {
    /// Nothing went wrong
    #[default]
    None = 0,
    /// Complete the current response, then close the connection
    CloseClean = 1,
    /// Stop I/O on the current request immediately
    CloseNow = 2,
    /// Stop I/O on the whole connection immediately
    CloseConnectionNow = 3,
}

impl ErrorState {
    /// Returns the more severe of `self` and `candidate`.
    #[inline]
    #[must_use]
    pub fn escalate(self, candidate: ErrorState) -> ErrorState {
        self.max(candidate)
    }

    /// Escalate in place, returning the previous value.
    #[inline]
    pub fn escalate_in_place(&mut self, candidate: ErrorState) -> ErrorState {
        let previous = *self;
        *self = previous.escalate(candidate);
        previous
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether request I/O may continue.
    #[inline]
    pub const fn is_io_allowed(self) -> bool {
        matches!(self, Self::None | Self::CloseClean)
    }

    /// Whether the connection as a whole may continue to be used.
    #[inline]
    pub const fn is_connection_io_allowed(self) -> bool {
        !matches!(self, Self::CloseConnectionNow)
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::CloseClean,
            2 => Self::CloseNow,
            _ => Self::CloseConnectionNow,
        }
    }
}
