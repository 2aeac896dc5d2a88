//! Connection endpoint lifecycle.
//!
//! A [`ConnectionEndpoint`] owns one descriptor from resolution to close,
//! either as a client (connect with address failover) or as a server
//! (listen and spawn child endpoints for accepted connections).
//!
//! # State machine
//!
//! ```text
//! Idle -> Resolving -> Connecting -> Open -> Closing -> Idle
//!                          |  ^
//!                          +--+ failover to the next candidate
//! Idle -> Listening -> Closing -> Idle
//! ```
//!
//! Every outcome is delivered to the status handler; nothing is raised
//! across the reactor.

use crate::channel::{Channel, ExceptionSink};
use crate::config::{EndpointConfig, SocketType};
use crate::net::resolve::{bind_address, AddressResolver, SystemResolver};
use crate::reactor::{Reactor, Readiness, ReadinessCallback};
use crate::{GatewayError, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, warn};

/// Invoked on every state-terminating outcome: `None` for success
/// (connected or accepted), `Some` with the reason otherwise.
pub type StatusHandler = Rc<dyn Fn(&ConnectionEndpoint, Option<&GatewayError>)>;

/// Server-side factory for the child endpoint of an accepted connection.
/// Returning `None` declines the connection.
pub type ConnectionFactory = Rc<dyn Fn(&ConnectionEndpoint) -> Option<ConnectionEndpoint>>;

/// Observable lifecycle state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Idle,
    Resolving,
    Connecting,
    Listening,
    Open,
    Closing,
}

enum Phase {
    Idle,
    Resolving,
    Connecting {
        socket: Rc<Socket>,
        fd: RawFd,
        addr: SocketAddr,
        remaining: VecDeque<SocketAddr>,
    },
    Listening {
        socket: Rc<Socket>,
        fd: RawFd,
    },
    Open {
        socket: Rc<Socket>,
        fd: RawFd,
    },
    Closing,
}

impl Phase {
    fn state(&self) -> EndpointState {
        match self {
            Phase::Idle => EndpointState::Idle,
            Phase::Resolving => EndpointState::Resolving,
            Phase::Connecting { .. } => EndpointState::Connecting,
            Phase::Listening { .. } => EndpointState::Listening,
            Phase::Open { .. } => EndpointState::Open,
            Phase::Closing => EndpointState::Closing,
        }
    }

    fn socket(&self) -> Option<&Rc<Socket>> {
        match self {
            Phase::Connecting { socket, .. }
            | Phase::Listening { socket, .. }
            | Phase::Open { socket, .. } => Some(socket),
            _ => None,
        }
    }
}

struct EndpointInner {
    reactor: Rc<dyn Reactor>,
    config: EndpointConfig,
    resolver: Rc<dyn AddressResolver>,
    phase: Phase,
    status_handler: Option<StatusHandler>,
    channel: Option<Rc<dyn Channel>>,
    factory: Option<ConnectionFactory>,
    children: Vec<ConnectionEndpoint>,
    parent: Option<WeakEndpoint>,
    failed_attempts: usize,
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        let fd = match &self.phase {
            Phase::Connecting { fd, .. } | Phase::Listening { fd, .. } | Phase::Open { fd, .. } => *fd,
            _ => return,
        };
        self.reactor.unregister_readiness(fd);
        if matches!(self.phase, Phase::Open { .. }) {
            if let Some(channel) = self.channel.take() {
                channel.detach();
            }
        }
        self.phase = Phase::Idle;
        debug!(fd, "Endpoint dropped, descriptor released");
    }
}

/// One socket's connect/listen/open/close lifecycle.
///
/// Cloning yields another handle to the same endpoint.
#[derive(Clone)]
pub struct ConnectionEndpoint {
    inner: Rc<RefCell<EndpointInner>>,
}

/// Non-owning handle to a [`ConnectionEndpoint`].
#[derive(Clone)]
pub struct WeakEndpoint(Weak<RefCell<EndpointInner>>);

impl WeakEndpoint {
    pub fn upgrade(&self) -> Option<ConnectionEndpoint> {
        self.0.upgrade().map(|inner| ConnectionEndpoint { inner })
    }
}

impl std::fmt::Debug for ConnectionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("ConnectionEndpoint")
                .field("target", &inner.config.target())
                .field("state", &inner.phase.state())
                .field("children", &inner.children.len())
                .finish(),
            Err(_) => f.write_str("ConnectionEndpoint { <busy> }"),
        }
    }
}

impl ConnectionEndpoint {
    pub fn new(reactor: Rc<dyn Reactor>, config: EndpointConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EndpointInner {
                reactor,
                config,
                resolver: Rc::new(SystemResolver),
                phase: Phase::Idle,
                status_handler: None,
                channel: None,
                factory: None,
                children: Vec::new(),
                parent: None,
                failed_attempts: 0,
            })),
        }
    }

    /// Replace the resolver used by [`initiate_connection`](Self::initiate_connection).
    pub fn with_resolver(self, resolver: Rc<dyn AddressResolver>) -> Self {
        self.inner.borrow_mut().resolver = resolver;
        self
    }

    pub fn set_status_handler(&self, handler: StatusHandler) {
        self.inner.borrow_mut().status_handler = Some(handler);
    }

    /// Channel the descriptor is handed to once the endpoint is open.
    pub fn set_channel(&self, channel: Rc<dyn Channel>) {
        self.inner.borrow_mut().channel = Some(channel);
    }

    pub fn set_connection_factory(&self, factory: ConnectionFactory) {
        self.inner.borrow_mut().factory = Some(factory);
    }

    pub fn config(&self) -> EndpointConfig {
        self.inner.borrow().config.clone()
    }

    pub fn state(&self) -> EndpointState {
        self.inner.borrow().phase.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == EndpointState::Open
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state(),
            EndpointState::Resolving | EndpointState::Connecting
        )
    }

    pub fn is_listening(&self) -> bool {
        self.state() == EndpointState::Listening
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.inner.borrow();
        inner.phase.socket()?.local_addr().ok()?.as_socket()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let inner = self.inner.borrow();
        match &inner.phase {
            Phase::Open { socket, .. } => socket.peer_addr().ok()?.as_socket(),
            _ => None,
        }
    }

    /// Live child endpoints of a server.
    pub fn child_count(&self) -> usize {
        self.inner.borrow().children.len()
    }

    /// Candidates abandoned during the current or last connect.
    pub fn failed_attempts(&self) -> usize {
        self.inner.borrow().failed_attempts
    }

    /// Whether both handles refer to the same endpoint.
    pub fn ptr_eq(&self, other: &ConnectionEndpoint) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint(Rc::downgrade(&self.inner))
    }

    /// Start connecting to the configured `host:service`.
    ///
    /// Resolution failures and an address list that fails outright are
    /// returned and also reported to the status handler. Otherwise one
    /// attempt is in flight and the outcome arrives via the status handler.
    pub fn initiate_connection(&self) -> Result<()> {
        let (config, resolver, listening) = {
            let inner = self.inner.borrow();
            if inner.parent.is_some() {
                debug!("Ignoring connect request on an accepted connection");
                return Ok(());
            }
            let listening = match inner.phase {
                Phase::Idle => false,
                Phase::Listening { .. } => true,
                _ => return Ok(()),
            };
            (inner.config.clone(), inner.resolver.clone(), listening)
        };

        if listening {
            return self.fail_now(GatewayError::Unsupported(
                "cannot connect a listening endpoint".to_string(),
            ));
        }
        if !config.connectable() {
            return self.fail_now(GatewayError::NoParams);
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.phase = Phase::Resolving;
            inner.failed_attempts = 0;
        }
        debug!("Resolving {}", config.target());

        let candidates = match resolver.resolve(&config) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.inner.borrow_mut().phase = Phase::Idle;
                return self.fail_now(e);
            }
        };

        match self.advance(candidates.into(), None) {
            Ok(()) => Ok(()),
            Err(last_error) => {
                if let Some(e) = last_error {
                    debug!("Last connect error for {}: {}", config.target(), e);
                }
                self.fail_now(GatewayError::NoConnection {
                    target: config.target(),
                })
            }
        }
    }

    /// Bind and listen on the configured service.
    ///
    /// Every setup failure is returned synchronously.
    pub fn start_server(&self, factory: ConnectionFactory) -> Result<()> {
        let config = {
            let inner = self.inner.borrow();
            if !matches!(inner.phase, Phase::Idle) {
                return Err(GatewayError::Unsupported(format!(
                    "cannot listen while {:?}",
                    inner.phase.state()
                )));
            }
            inner.config.clone()
        };
        if config.service.is_empty() {
            return Err(GatewayError::NoParams);
        }

        let addr = bind_address(&config)?;
        let socket = Socket::new(
            Domain::for_address(addr),
            socket_type(config.socket_type),
            Some(Protocol::from(config.effective_protocol())),
        )
        .map_err(|e| GatewayError::socket("Cannot create server socket", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| GatewayError::socket("Cannot set SO_REUSEADDR", e))?;
        socket
            .bind(&SockAddr::from(addr))
            .map_err(|e| GatewayError::socket(format!("Cannot bind to {}", addr), e))?;
        if config.socket_type == SocketType::Stream {
            let backlog = i32::try_from(config.max_connections).unwrap_or(i32::MAX);
            socket
                .listen(backlog)
                .map_err(|e| GatewayError::socket(format!("Cannot listen on {}", addr), e))?;
        }
        socket
            .set_nonblocking(true)
            .map_err(|e| GatewayError::socket("Cannot make server socket non-blocking", e))?;

        let socket = Rc::new(socket);
        let fd = socket.as_raw_fd();
        let local = socket
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);

        let reactor = {
            let mut inner = self.inner.borrow_mut();
            inner.factory = Some(factory);
            inner.phase = Phase::Listening { socket, fd };
            inner.reactor.clone()
        };
        if config.socket_type == SocketType::Stream {
            let weak = self.downgrade();
            let on_acceptable: ReadinessCallback = Rc::new(move |_fd, _flags| {
                if let Some(endpoint) = weak.upgrade() {
                    endpoint.accept_one();
                }
            });
            reactor.register_readiness(fd, Readiness::READABLE, on_acceptable);
        }

        info!("Listening on {}", local);
        Ok(())
    }

    /// Tear the endpoint down.
    ///
    /// No-op unless connecting, listening or open. A server closes every
    /// child first. An in-flight connect is abandoned without a status
    /// report; otherwise the status handler receives `Closed` once.
    pub fn close_connection(&self) {
        let phase = {
            let mut inner = self.inner.borrow_mut();
            match inner.phase {
                Phase::Connecting { .. } | Phase::Listening { .. } | Phase::Open { .. } => {
                    std::mem::replace(&mut inner.phase, Phase::Closing)
                }
                _ => return,
            }
        };

        match phase {
            Phase::Connecting { fd, addr, .. } => {
                self.reactor().unregister_readiness(fd);
                self.inner.borrow_mut().phase = Phase::Idle;
                debug!("Abandoned connect to {}", addr);
            }
            Phase::Listening { socket, fd } => {
                self.reactor().unregister_readiness(fd);
                drop(socket);
                let children = std::mem::take(&mut self.inner.borrow_mut().children);
                debug!("Closing server with {} child connection(s)", children.len());
                for child in children {
                    child.close_connection();
                }
                self.inner.borrow_mut().phase = Phase::Idle;
                info!("Server closed");
                self.report(Some(&GatewayError::Closed));
            }
            Phase::Open { socket, fd } => {
                self.release_open(socket, fd);
                debug!("Connection closed");
                self.report(Some(&GatewayError::Closed));
            }
            _ => {}
        }
    }

    /// Close once the channel has written everything queued.
    ///
    /// Closes at once when open without a channel or with nothing queued;
    /// otherwise behaves like [`close_connection`](Self::close_connection).
    pub fn close_after_send(&self) {
        let channel = {
            let inner = self.inner.borrow();
            match inner.phase {
                Phase::Open { .. } => inner.channel.clone(),
                _ => None,
            }
        };
        let Some(channel) = channel else {
            self.close_connection();
            return;
        };

        debug!("Closing after {} queued byte(s) are sent", channel.pending_output());
        let weak = self.downgrade();
        channel.on_drained(Box::new(move || {
            if let Some(endpoint) = weak.upgrade() {
                endpoint.close_connection();
            }
        }));
    }

    fn reactor(&self) -> Rc<dyn Reactor> {
        self.inner.borrow().reactor.clone()
    }

    fn report(&self, error: Option<&GatewayError>) {
        let handler = self.inner.borrow().status_handler.clone();
        match handler {
            Some(handler) => handler(self, error),
            None => {
                if let Some(e) = error {
                    debug!("No status handler for: {}", e);
                }
            }
        }
    }

    fn fail_now(&self, error: GatewayError) -> Result<()> {
        warn!("Connection setup failed: {}", error);
        self.report(Some(&error));
        Err(error)
    }

    /// Try candidates in order until one attempt is in flight.
    ///
    /// Returns the last error seen when the list runs out.
    fn advance(
        &self,
        mut remaining: VecDeque<SocketAddr>,
        mut last_error: Option<GatewayError>,
    ) -> std::result::Result<(), Option<GatewayError>> {
        let config = self.inner.borrow().config.clone();
        while let Some(addr) = remaining.pop_front() {
            match start_attempt(&config, addr) {
                Ok(socket) => {
                    let socket = Rc::new(socket);
                    let fd = socket.as_raw_fd();
                    let reactor = {
                        let mut inner = self.inner.borrow_mut();
                        inner.phase = Phase::Connecting {
                            socket,
                            fd,
                            addr,
                            remaining,
                        };
                        inner.reactor.clone()
                    };
                    let weak = self.downgrade();
                    let on_writable: ReadinessCallback = Rc::new(move |fd, flags| {
                        if let Some(endpoint) = weak.upgrade() {
                            endpoint.connect_ready(fd, flags);
                        }
                    });
                    reactor.register_readiness(fd, Readiness::WRITABLE, on_writable);
                    debug!("Connecting to {}", addr);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    self.inner.borrow_mut().failed_attempts += 1;
                    last_error = Some(e);
                }
            }
        }
        self.inner.borrow_mut().phase = Phase::Idle;
        Err(last_error)
    }

    fn connect_ready(&self, fd: RawFd, flags: Readiness) {
        let (socket, addr) = {
            let inner = self.inner.borrow();
            match &inner.phase {
                Phase::Connecting {
                    socket,
                    fd: pending,
                    addr,
                    ..
                } if *pending == fd => (socket.clone(), *addr),
                _ => return,
            }
        };
        self.reactor().unregister_readiness(fd);

        let outcome = if flags.contains(Readiness::HANGUP) {
            Err(GatewayError::HungUp(format!("{} rejected the connection", addr)))
        } else {
            match socket.take_error() {
                Ok(None) => Ok(()),
                Ok(Some(e)) => Err(GatewayError::socket(format!("Cannot connect to {}", addr), e)),
                Err(e) => Err(GatewayError::socket("Cannot read socket error", e)),
            }
        };
        drop(socket);

        let phase = std::mem::replace(&mut self.inner.borrow_mut().phase, Phase::Idle);
        let Phase::Connecting {
            socket, remaining, ..
        } = phase
        else {
            return;
        };

        match outcome {
            Ok(()) => {
                self.inner.borrow_mut().phase = Phase::Open { socket, fd };
                info!("Connected to {}", addr);
                self.enter_open();
                self.report(None);
            }
            Err(e) => {
                drop(socket);
                warn!("Connect attempt failed: {}", e);
                self.inner.borrow_mut().failed_attempts += 1;
                if let Err(last_error) = self.advance(remaining, Some(e)) {
                    let target = self.inner.borrow().config.target();
                    let error = last_error.unwrap_or(GatewayError::NoConnection { target });
                    self.report(Some(&error));
                }
            }
        }
    }

    fn accept_one(&self) {
        let (listener, config) = {
            let inner = self.inner.borrow();
            match &inner.phase {
                Phase::Listening { socket, .. } => (socket.clone(), inner.config.clone()),
                _ => return,
            }
        };

        let (socket, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                return
            }
            Err(e) => {
                error!("Accept failed: {}", e);
                return;
            }
        };
        drop(listener);
        let peer = peer
            .as_socket()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown peer".to_string());
        info!("Accepted connection from {}", peer);

        if let Err(e) = socket.set_nonblocking(true) {
            error!("Cannot make connection from {} non-blocking: {}", peer, e);
            return;
        }

        if config.enforce_connection_limit && self.child_count() >= config.max_connections as usize
        {
            warn!(
                "Rejecting connection from {}: at max capacity ({})",
                peer, config.max_connections
            );
            shutdown_declined(&socket, &peer);
            return;
        }

        let factory = self.inner.borrow().factory.clone();
        let child = factory.and_then(|factory| factory(self));
        let Some(child) = child else {
            debug!("Connection from {} declined", peer);
            shutdown_declined(&socket, &peer);
            return;
        };
        if child.ptr_eq(self) || child.state() != EndpointState::Idle {
            warn!("Connection factory returned an endpoint in use; dropping {}", peer);
            shutdown_declined(&socket, &peer);
            return;
        }

        self.inner.borrow_mut().children.push(child.clone());
        child.adopt(socket, self.downgrade());
    }

    /// Take over an accepted descriptor as a child of `parent`.
    fn adopt(&self, socket: Socket, parent: WeakEndpoint) {
        let socket = Rc::new(socket);
        let fd = socket.as_raw_fd();
        {
            let mut inner = self.inner.borrow_mut();
            inner.parent = Some(parent);
            inner.phase = Phase::Open { socket, fd };
        }
        self.enter_open();
        self.report(None);
    }

    /// Hand the open descriptor to the channel, or watch it directly when
    /// there is none.
    fn enter_open(&self) {
        let (socket, fd, channel, reactor) = {
            let inner = self.inner.borrow();
            match &inner.phase {
                Phase::Open { socket, fd } => (
                    socket.clone(),
                    *fd,
                    inner.channel.clone(),
                    inner.reactor.clone(),
                ),
                _ => return,
            }
        };

        let weak = self.downgrade();
        match channel {
            Some(channel) => {
                let sink: ExceptionSink = Rc::new(move |flags, io_error| {
                    if let Some(endpoint) = weak.upgrade() {
                        endpoint.handle_exception(flags, io_error);
                    }
                });
                channel.attach(socket, sink);
            }
            None => {
                let watcher: ReadinessCallback = Rc::new(move |_fd, flags| {
                    if let Some(endpoint) = weak.upgrade() {
                        endpoint.handle_exception(flags, None);
                    }
                });
                reactor.register_readiness(fd, Readiness::empty(), watcher);
            }
        }
    }

    /// Classify a terminal condition on an open descriptor and close.
    ///
    /// An I/O error already taken off the socket wins over the flags, since
    /// reading it cleared the pending socket error.
    fn handle_exception(&self, flags: Readiness, io_error: Option<std::io::Error>) {
        let socket = {
            let inner = self.inner.borrow();
            match &inner.phase {
                Phase::Open { socket, .. } => socket.clone(),
                _ => return,
            }
        };

        let error = if let Some(e) = io_error {
            GatewayError::socket("Connection error", e)
        } else if flags.contains(Readiness::HANGUP) {
            GatewayError::HungUp("peer hung up".to_string())
        } else if flags.contains(Readiness::READABLE) {
            match socket.take_error() {
                Ok(Some(e)) => GatewayError::socket("Connection error", e),
                _ => GatewayError::HungUp("readable but no data".to_string()),
            }
        } else {
            match socket.take_error() {
                Ok(Some(e)) => GatewayError::socket("Connection error", e),
                Ok(None) => GatewayError::socket(
                    "Connection error",
                    std::io::Error::other("poll reported an error but none is pending"),
                ),
                Err(e) => GatewayError::socket("Cannot read socket error", e),
            }
        };
        drop(socket);

        let phase = std::mem::replace(&mut self.inner.borrow_mut().phase, Phase::Closing);
        let (socket, fd) = match phase {
            Phase::Open { socket, fd } => (socket, fd),
            other => {
                self.inner.borrow_mut().phase = other;
                return;
            }
        };
        self.release_open(socket, fd);
        warn!("Connection lost: {}", error);
        self.report(Some(&error));
    }

    /// Free an open descriptor and leave the parent's child set.
    fn release_open(&self, socket: Rc<Socket>, fd: RawFd) {
        let (channel, reactor, parent) = {
            let inner = self.inner.borrow();
            (
                inner.channel.clone(),
                inner.reactor.clone(),
                inner.parent.clone(),
            )
        };
        if let Some(channel) = channel {
            channel.detach();
        }
        reactor.unregister_readiness(fd);
        drop(socket);
        self.inner.borrow_mut().phase = Phase::Idle;

        if let Some(parent) = parent.and_then(|p| p.upgrade()) {
            parent
                .inner
                .borrow_mut()
                .children
                .retain(|child| !child.ptr_eq(self));
        }
    }
}

/// Shut down an accepted descriptor that gets no child endpoint.
fn shutdown_declined(socket: &Socket, peer: &str) {
    if let Err(e) = socket.shutdown(Shutdown::Both) {
        debug!("Shutdown of declined connection from {} failed: {}", peer, e);
    }
}

fn socket_type(socket_type: SocketType) -> Type {
    match socket_type {
        SocketType::Stream => Type::STREAM,
        SocketType::Datagram => Type::DGRAM,
    }
}

/// Create a non-blocking socket and start connecting it to `addr`.
fn start_attempt(config: &EndpointConfig, addr: SocketAddr) -> Result<Socket> {
    let socket = Socket::new(
        Domain::for_address(addr),
        socket_type(config.socket_type),
        Some(Protocol::from(config.effective_protocol())),
    )
    .map_err(|e| GatewayError::socket("Cannot create socket", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| GatewayError::socket("Cannot make socket non-blocking", e))?;

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => Ok(socket),
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == ErrorKind::WouldBlock =>
        {
            Ok(socket)
        }
        Err(e) => Err(GatewayError::socket(format!("Cannot connect to {}", addr), e)),
    }
}
