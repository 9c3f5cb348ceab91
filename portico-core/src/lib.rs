// Connection and request-processing core for the Portico connector
// Processors, the async state machine and the protocol handler live here; the
// endpoint (sockets, pollers, TLS) and the application container plug in
// through the SocketWrapper and Adapter traits

pub mod action;
pub mod adapter;
pub mod async_state;
pub mod codec;
pub mod config;
pub mod error;
pub mod error_state;
pub mod logging;
pub mod processor;
pub mod protocol;
pub mod request;
pub mod response;
pub mod socket;
pub mod stats;
pub mod upgrade;

pub use action::{Action, ActionHook, ActionReply, AsyncHandle, PushRequest};
pub use adapter::Adapter;
pub use async_state::{AsyncCallback, AsyncState, AsyncStateMachine, ThreadOrigin};
pub use codec::{CodecFactory, ExchangeCodec, ParseStatus};
pub use config::ProtocolConfig;
pub use error::{Error, Result};
pub use error_state::ErrorState;
pub use processor::{
    AjpProcessor, AsyncTimeoutHandle, ExternalUpgradeProcessor, Http11Processor,
    InternalUpgradeProcessor, Processor, ProcessorContext, ProcessorCore, ProcessorId,
    ProtocolProcessor,
};
pub use protocol::{
    ConnectionHandler, LifecycleState, ProcessorKind, ProtocolHandler, ProtocolHandlerBuilder,
};
pub use request::{ReadListener, Request};
pub use response::{Response, WriteListener};
pub use socket::{DispatchType, SocketEvent, SocketId, SocketState, SocketWrapper, Task};
pub use stats::{RequestGroupInfo, RequestInfo, RequestStage, RequestStats};
pub use upgrade::{
    HttpUpgradeHandler, InternalUpgradeHandler, UpgradeConnection, UpgradeHandler,
    UpgradeProtocol, UpgradeRegistry, UpgradeToken,
};

// Re-export for hosts that log through the same facade
pub use tracing;
