//! Message channels over an open descriptor.
//!
//! A channel owns no lifecycle decisions: it frames outgoing messages,
//! decodes incoming ones, and reports descriptor conditions it cannot handle
//! (EOF, hang-up, errors) to the endpoint that attached it.
//!
//! # Architecture
//!
//! - **Channel**: the capability an endpoint hands its descriptor to
//! - **JsonChannel**: length-prefixed JSON implementation
//! - **frame**: shared framing used by both sides of a connection

pub mod frame;
mod json;

pub use json::JsonChannel;

use crate::reactor::Readiness;
use crate::Result;
use serde_json::Value;
use socket2::Socket;
use std::rc::Rc;
use thiserror::Error;

/// Delivers one decoded message, or the reason one could not be decoded.
pub type MessageHandler = Rc<dyn Fn(std::result::Result<Value, DecodeError>)>;

/// Receives descriptor conditions the channel cannot resolve itself,
/// together with the I/O error that surfaced them, if any.
///
/// `READABLE` means the descriptor was readable but yielded no data.
pub type ExceptionSink = Rc<dyn Fn(Readiness, Option<std::io::Error>)>;

/// Invoked once when a channel lets go of its descriptor.
pub type DetachHandler = Rc<dyn Fn()>;

/// Invoked once when all queued output has been written.
pub type DrainedHandler = Box<dyn FnOnce()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// Complete frame whose payload is not valid JSON.
    Parse,
    /// Framing-level failure such as an oversized frame.
    Transport,
}

/// A message that arrived but could not be decoded.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub message: String,
    /// Whatever bytes of the message were received.
    pub partial: Vec<u8>,
}

/// Framing layer over one open descriptor.
pub trait Channel {
    /// Take over an open, non-blocking socket.
    fn attach(&self, socket: Rc<Socket>, on_exception: ExceptionSink);

    /// Release the socket and stop all callbacks. No-op when not attached.
    fn detach(&self);

    fn is_attached(&self) -> bool;

    /// Encode and transmit one message.
    fn send(&self, message: &Value) -> Result<()>;

    /// Bytes queued but not yet accepted by the socket.
    fn pending_output(&self) -> usize;

    /// Run `handler` once the output queue is empty, immediately if it
    /// already is. Dropped unrun when the channel detaches first.
    fn on_drained(&self, handler: DrainedHandler);

    fn set_message_handler(&self, handler: MessageHandler);

    fn set_detach_handler(&self, handler: DetachHandler);
}
