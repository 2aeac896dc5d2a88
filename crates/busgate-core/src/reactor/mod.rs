//! Single-threaded cooperative reactor.
//!
//! Everything in this crate runs on one reactor thread. Waiting for a
//! connect, an accept or incoming data is expressed as a callback registered
//! here, never as a blocking call.
//!
//! # Architecture
//!
//! - **Reactor**: the trait endpoints and channels are written against
//! - **PollReactor**: a `poll(2)` implementation with one-shot timers

mod poll;

pub use poll::PollReactor;

use bitflags::bitflags;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

bitflags! {
    /// Set of readiness conditions on a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Readiness: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        /// Error pending on the descriptor.
        const ERROR    = 0b0100;
        /// Peer hung up.
        const HANGUP   = 0b1000;
    }
}

/// Handle for a scheduled one-shot callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(pub(crate) u64);

/// Invoked with the descriptor and the conditions that fired.
pub type ReadinessCallback = Rc<dyn Fn(RawFd, Readiness)>;

/// Invoked once when a scheduled timer expires.
pub type TimerCallback = Box<dyn FnOnce()>;

/// Readiness registration and timer scheduling.
///
/// Callbacks run on the reactor thread and may call back into the reactor,
/// including unregistering or cancelling themselves.
pub trait Reactor {
    /// Watch `fd` for `interest`, replacing any previous registration for it.
    ///
    /// `ERROR` and `HANGUP` are always reported, whether requested or not.
    fn register_readiness(&self, fd: RawFd, interest: Readiness, callback: ReadinessCallback);

    /// Stop watching `fd`. Unknown descriptors are ignored.
    fn unregister_readiness(&self, fd: RawFd);

    /// Run `callback` once after `delay`.
    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerToken;

    /// Cancel a scheduled callback. Fired or unknown tokens are ignored.
    fn cancel(&self, token: TimerToken);
}
