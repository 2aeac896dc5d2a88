//! JSON-RPC 2.0 over a [`Channel`](crate::channel::Channel).
//!
//! # Architecture
//!
//! - **message**: wire envelopes, validation and the error code table
//! - **RpcSession**: id allocation, pending-call correlation and dispatch
//!   of incoming requests to a single request handler

mod message;
mod session;

pub use message::{
    format_error_code, InvalidEnvelope, RpcErrorObject, RpcMessage, RpcRequest, RpcResponse,
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION, METHOD_NOT_FOUND,
    PARSE_ERROR, SERVER_ERROR,
};
pub use session::{internal_error, RequestHandler, ResponseHandler, RpcSession};
