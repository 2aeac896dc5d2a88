//! Length-prefixed JSON channel.

use super::frame::{encode_frame, Frame, FrameDecoder};
use super::{
    Channel, DecodeError, DecodeErrorKind, DetachHandler, DrainedHandler, ExceptionSink,
    MessageHandler,
};
use crate::config::TransportConfig;
use crate::reactor::{Reactor, Readiness, ReadinessCallback};
use crate::{GatewayError, Result};
use bytes::{Buf, BytesMut};
use serde_json::Value;
use socket2::Socket;
use std::cell::RefCell;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

struct Link {
    socket: Rc<Socket>,
    fd: RawFd,
    on_exception: ExceptionSink,
    callback: ReadinessCallback,
    write_interest: bool,
}

struct ChannelState {
    link: Option<Link>,
    inbound: BytesMut,
    outbound: BytesMut,
    decoder: FrameDecoder,
    max_frame: usize,
    message_handler: Option<MessageHandler>,
    detach_handler: Option<DetachHandler>,
    drained: Option<DrainedHandler>,
}

struct ChannelShared {
    reactor: Rc<dyn Reactor>,
    state: RefCell<ChannelState>,
}

/// Channel exchanging length-prefixed JSON values over a stream socket.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct JsonChannel {
    shared: Rc<ChannelShared>,
}

impl JsonChannel {
    pub fn new(reactor: Rc<dyn Reactor>) -> Self {
        Self::with_max_frame_size(reactor, TransportConfig::MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(reactor: Rc<dyn Reactor>, max_frame: usize) -> Self {
        Self {
            shared: Rc::new(ChannelShared {
                reactor,
                state: RefCell::new(ChannelState {
                    link: None,
                    inbound: BytesMut::new(),
                    outbound: BytesMut::new(),
                    decoder: FrameDecoder::new(max_frame),
                    max_frame,
                    message_handler: None,
                    detach_handler: None,
                    drained: None,
                }),
            }),
        }
    }

    fn from_weak(weak: &Weak<ChannelShared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn on_ready(&self, flags: Readiness) {
        if flags.contains(Readiness::WRITABLE) {
            if let Err(e) = self.flush() {
                debug!("Channel write failed: {}", e);
                self.raise(Readiness::ERROR, Some(e));
                return;
            }
        }

        if flags.contains(Readiness::READABLE) {
            let read = self.fill_inbound();
            self.deliver_frames();
            match read {
                Ok(true) => {
                    self.raise(Readiness::READABLE, None);
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    debug!("Channel read failed: {}", e);
                    self.raise(Readiness::ERROR, Some(e));
                    return;
                }
            }
        }

        if flags.contains(Readiness::HANGUP) {
            self.raise(Readiness::HANGUP, None);
        } else if flags.contains(Readiness::ERROR) {
            self.raise(Readiness::ERROR, None);
        }
    }

    /// Read until the socket would block. Returns true on end of stream.
    fn fill_inbound(&self) -> std::io::Result<bool> {
        let Some(socket) = self.socket() else {
            return Ok(false);
        };
        let mut chunk = vec![0u8; TransportConfig::READ_CHUNK_SIZE];
        loop {
            match (&*socket).read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    trace!(bytes = n, "channel read");
                    self.shared
                        .state
                        .borrow_mut()
                        .inbound
                        .extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn deliver_frames(&self) {
        loop {
            let frame = {
                let mut state = self.shared.state.borrow_mut();
                if state.link.is_none() {
                    // Detached by an earlier handler
                    return;
                }
                let ChannelState {
                    decoder, inbound, ..
                } = &mut *state;
                match decoder.decode(inbound) {
                    Some(frame) => frame,
                    None => return,
                }
            };

            let message = match frame {
                Frame::Payload(payload) => {
                    serde_json::from_slice::<Value>(&payload).map_err(|e| DecodeError {
                        kind: DecodeErrorKind::Parse,
                        message: format!("Parse error: {}", e),
                        partial: payload.to_vec(),
                    })
                }
                Frame::Oversized { size, head } => {
                    let max = self.shared.state.borrow().max_frame;
                    Err(DecodeError {
                        kind: DecodeErrorKind::Transport,
                        message: GatewayError::FrameTooLarge { size, max }.to_string(),
                        partial: head.to_vec(),
                    })
                }
            };

            let handler = self.shared.state.borrow().message_handler.clone();
            match handler {
                Some(handler) => handler(message),
                None => debug!("Dropping incoming message: no message handler"),
            }
        }
    }

    /// Write queued output until the socket would block, adjusting the
    /// registered interest to match what is left.
    ///
    /// Runs the drained handler once nothing is left.
    fn flush(&self) -> std::io::Result<()> {
        let (reregister, drained) = {
            let mut state = self.shared.state.borrow_mut();
            let (socket, write_interest) = match state.link.as_ref() {
                Some(link) => (link.socket.clone(), link.write_interest),
                None => return Ok(()),
            };

            while !state.outbound.is_empty() {
                match socket.send_with_flags(&state.outbound, SEND_FLAGS) {
                    Ok(0) => break,
                    Ok(n) => state.outbound.advance(n),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            let want_write = !state.outbound.is_empty();
            let drained = if want_write { None } else { state.drained.take() };
            let reregister = match state.link.as_mut() {
                Some(link) if want_write != write_interest => {
                    link.write_interest = want_write;
                    let interest = if want_write {
                        Readiness::READABLE | Readiness::WRITABLE
                    } else {
                        Readiness::READABLE
                    };
                    Some((link.fd, interest, link.callback.clone()))
                }
                _ => None,
            };
            (reregister, drained)
        };

        if let Some((fd, interest, callback)) = reregister {
            self.shared.reactor.register_readiness(fd, interest, callback);
        }
        if let Some(drained) = drained {
            trace!("channel output drained");
            drained();
        }
        Ok(())
    }

    fn socket(&self) -> Option<Rc<Socket>> {
        self.shared
            .state
            .borrow()
            .link
            .as_ref()
            .map(|link| link.socket.clone())
    }

    fn raise(&self, flags: Readiness, error: Option<std::io::Error>) {
        let sink = self
            .shared
            .state
            .borrow()
            .link
            .as_ref()
            .map(|link| link.on_exception.clone());
        if let Some(sink) = sink {
            sink(flags, error);
        }
    }
}

impl Channel for JsonChannel {
    fn attach(&self, socket: Rc<Socket>, on_exception: ExceptionSink) {
        self.detach();

        let fd = socket.as_raw_fd();
        let weak = Rc::downgrade(&self.shared);
        let callback: ReadinessCallback = Rc::new(move |_fd, flags| {
            if let Some(channel) = JsonChannel::from_weak(&weak) {
                channel.on_ready(flags);
            }
        });

        {
            let mut state = self.shared.state.borrow_mut();
            state.inbound.clear();
            state.outbound.clear();
            state.decoder.reset();
            state.link = Some(Link {
                socket,
                fd,
                on_exception,
                callback: callback.clone(),
                write_interest: false,
            });
        }
        self.shared
            .reactor
            .register_readiness(fd, Readiness::READABLE, callback);
        debug!(fd, "Channel attached");
    }

    fn detach(&self) {
        let (link, handler, drained) = {
            let mut state = self.shared.state.borrow_mut();
            let link = state.link.take();
            state.inbound.clear();
            state.outbound.clear();
            state.decoder.reset();
            (link, state.detach_handler.clone(), state.drained.take())
        };
        drop(drained);
        let Some(link) = link else {
            return;
        };
        self.shared.reactor.unregister_readiness(link.fd);
        debug!(fd = link.fd, "Channel detached");
        drop(link);
        if let Some(handler) = handler {
            handler();
        }
    }

    fn is_attached(&self) -> bool {
        self.shared.state.borrow().link.is_some()
    }

    fn send(&self, message: &Value) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        {
            let mut state = self.shared.state.borrow_mut();
            if state.link.is_none() {
                return Err(GatewayError::NotConnected);
            }
            let max = state.max_frame;
            encode_frame(&payload, max, &mut state.outbound)?;
        }
        self.flush()
            .map_err(|e| GatewayError::socket("Cannot write to connection", e))
    }

    fn pending_output(&self) -> usize {
        self.shared.state.borrow().outbound.len()
    }

    fn on_drained(&self, handler: DrainedHandler) {
        let run_now = {
            let mut state = self.shared.state.borrow_mut();
            if state.link.is_none() {
                None
            } else if state.outbound.is_empty() {
                Some(handler)
            } else {
                state.drained = Some(handler);
                None
            }
        };
        if let Some(handler) = run_now {
            handler();
        }
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.shared.state.borrow_mut().message_handler = Some(handler);
    }

    fn set_detach_handler(&self, handler: DetachHandler) {
        self.shared.state.borrow_mut().detach_handler = Some(handler);
    }
}
