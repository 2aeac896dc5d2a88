//! Socket lifecycle: address resolution and connection endpoints.
//!
//! # Architecture
//!
//! - **ConnectionEndpoint**: connect with failover, listen/accept, close
//! - **resolve**: candidate addresses for clients and bind addresses for servers

mod endpoint;
pub mod resolve;

pub use endpoint::{
    ConnectionEndpoint, ConnectionFactory, EndpointState, StatusHandler, WeakEndpoint,
};
pub use resolve::{bind_address, resolve_service, AddressResolver, StaticResolver, SystemResolver};
