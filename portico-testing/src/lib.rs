//! Testing utilities for the Portico connector core.
//!
//! The core never touches a real network, so everything around it can be
//! replaced by an in-memory double:
//!
//! - [`MockSocket`] - scripted input, recorded output and event requests
//! - [`CodecScript`] / [`ScriptedCodec`] - parse answers queued by the test
//! - [`ScriptedAdapter`] - application behaviour supplied as closures
//! - [`MockUpgradeProtocol`] - upgrade target that records what it sees
//! - [`TestEndpoint`] - worker pool delivering events like a real endpoint
//!
//! ## Quick Start
//!
//! ```
//! use portico_core::{ProtocolHandler, SocketEvent, SocketState, SocketWrapper};
//! use portico_testing::*;
//! use std::sync::Arc;
//!
//! let script = CodecScript::new();
//! script.push_request(RequestHead::get("/hello"));
//!
//! let adapter = ScriptedAdapter::new().into_arc();
//! let protocol = ProtocolHandler::http11()
//!     .adapter(adapter.clone())
//!     .codecs(script.factory())
//!     .build()
//!     .unwrap();
//!
//! let socket: Arc<dyn SocketWrapper> = Arc::new(MockSocket::new());
//! assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Open);
//! assert_eq!(adapter.service_count(), 1);
//! assert_eq!(script.statuses(), vec![200]);
//! ```

mod adapter;
mod codec;
mod endpoint;
mod socket;
mod upgrade;

pub use adapter::{AdapterCall, RecordingCallback, ScriptedAdapter};
pub use codec::{CodecCall, CodecScript, Parse, RequestHead, ScriptedCodec};
pub use endpoint::TestEndpoint;
pub use socket::MockSocket;
pub use upgrade::{
    EchoUpgradeHandler, MockUpgradeProtocol, RecordingUpgradeHandler, UpgradeEvent, UpgradeLog,
};

/// Route `tracing` output through the test harness's captured writer.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("portico_core=debug")),
        )
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}
