//! Busgate Core - asynchronous connection lifecycle and JSON-RPC 2.0 sessions.
//!
//! Everything runs on a single-threaded cooperative reactor: connects,
//! accepts and incoming data are callbacks, never blocking calls. A
//! [`ConnectionEndpoint`] owns a socket from resolution to close and hands
//! the open descriptor to a [`Channel`]; an [`RpcSession`] speaks JSON-RPC
//! over that channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use busgate_core::{ConnectionEndpoint, EndpointConfig, JsonChannel, PollReactor, RpcSession};
//! use std::rc::Rc;
//!
//! let reactor = Rc::new(PollReactor::new());
//! let channel = Rc::new(JsonChannel::new(reactor.clone()));
//! let session = RpcSession::new(channel.clone());
//!
//! let client = ConnectionEndpoint::new(reactor.clone(), EndpointConfig::client("localhost", "8440"));
//! client.set_channel(channel);
//! client.set_status_handler(Rc::new(move |_, error| {
//!     if error.is_none() {
//!         let _ = session.send_request("ping", None, Some(Box::new(|_, error, result| {
//!             println!("{:?} {:?}", error, result);
//!         })));
//!     }
//! }));
//! client.initiate_connection()?;
//! reactor.run()?;
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod net;
pub mod reactor;
pub mod rpc;

// Re-export commonly used types
pub use channel::{Channel, DecodeError, DecodeErrorKind, JsonChannel};
pub use config::{AddressFamily, EndpointConfig, SocketType, TransportConfig};
pub use error::{ErrorCategory, GatewayError, Result};
pub use net::{
    AddressResolver, ConnectionEndpoint, ConnectionFactory, EndpointState, StaticResolver,
    StatusHandler, SystemResolver, WeakEndpoint,
};
pub use reactor::{PollReactor, Reactor, Readiness, TimerToken};
pub use rpc::{RequestHandler, ResponseHandler, RpcMessage, RpcSession};
