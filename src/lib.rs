// Portico - connector core for HTTP/1.1 and AJP servers
//
// This crate re-exports the processor, async state machine and protocol
// handler from portico-core; endpoints and containers build on top of it.

// Re-export core functionality
pub use portico_core::*;

// Test doubles for endpoints, codecs and adapters
#[cfg(feature = "testing")]
pub use portico_testing;

/// Common imports for embedding the connector.
pub mod prelude {
    pub use portico_core::{
        Action, ActionReply, Adapter, AsyncCallback, AsyncHandle, CodecFactory, Error,
        ErrorState, ExchangeCodec, ParseStatus, ProtocolConfig, ProtocolHandler, Request,
        Response, Result, SocketEvent, SocketId, SocketState, SocketWrapper, ThreadOrigin,
        UpgradeProtocol,
    };
}
