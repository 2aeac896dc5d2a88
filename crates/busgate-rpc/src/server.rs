//! Serving JSON-RPC sessions on accepted connections.
//!
//! Every accepted connection gets its own child endpoint, `JsonChannel` and
//! `RpcSession`, tracked in a [`ConnectionRegistry`] until it closes.

use crate::handler;
use anyhow::{Context, Result};
use busgate_core::{
    Channel, ConnectionEndpoint, EndpointConfig, JsonChannel, PollReactor, Reactor, RpcSession,
    TimerToken,
};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io::Write;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the reactor checks for Ctrl-C.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long queued replies may take to go out at shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ServeOptions {
    pub port: String,
    pub backlog: u32,
    pub allow_non_local: bool,
    pub enforce_limit: bool,
}

struct Connection {
    endpoint: ConnectionEndpoint,
    // Held so the session stays alive until the connection closes
    _session: RpcSession,
    peer: Option<SocketAddr>,
}

/// Live connections keyed by a per-server connection number.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: Cell<u64>,
    connections: RefCell<BTreeMap<u64, Connection>>,
}

impl ConnectionRegistry {
    fn insert(&self, endpoint: ConnectionEndpoint, session: RpcSession) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        let peer = endpoint.peer_addr();
        self.connections.borrow_mut().insert(
            id,
            Connection {
                endpoint,
                _session: session,
                peer,
            },
        );
        id
    }

    fn set_peer(&self, id: u64, peer: Option<SocketAddr>) {
        if let Some(connection) = self.connections.borrow_mut().get_mut(&id) {
            connection.peer = peer;
        }
    }

    fn remove(&self, id: u64) {
        let removed = self.connections.borrow_mut().remove(&id);
        drop(removed);
    }

    pub fn len(&self) -> usize {
        self.connections.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.borrow().is_empty()
    }

    fn endpoints(&self) -> Vec<ConnectionEndpoint> {
        self.connections
            .borrow()
            .values()
            .map(|c| c.endpoint.clone())
            .collect()
    }

    pub fn peers(&self) -> Vec<String> {
        self.connections
            .borrow()
            .values()
            .map(|c| c.peer.map_or_else(|| "unknown".to_string(), |p| p.to_string()))
            .collect()
    }
}

/// What request handlers may reach on the server.
pub struct ServerContext {
    pub reactor: Rc<PollReactor>,
    registry: Weak<ConnectionRegistry>,
}

impl ServerContext {
    pub fn new(reactor: Rc<PollReactor>, registry: &Rc<ConnectionRegistry>) -> Self {
        Self {
            reactor,
            registry: Rc::downgrade(registry),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.upgrade().map_or(0, |r| r.len())
    }

    pub fn peers(&self) -> Vec<String> {
        self.registry.upgrade().map(|r| r.peers()).unwrap_or_default()
    }
}

/// Build the child endpoint and session for one accepted connection.
fn spawn_connection(
    context: &Rc<ServerContext>,
    registry: &Rc<ConnectionRegistry>,
    parent: &ConnectionEndpoint,
) -> ConnectionEndpoint {
    let reactor = context.reactor.clone();
    let endpoint = ConnectionEndpoint::new(reactor.clone(), parent.config());
    let channel: Rc<dyn Channel> = Rc::new(JsonChannel::new(reactor));
    endpoint.set_channel(channel.clone());

    let session = RpcSession::new(channel);
    let handler_context = context.clone();
    session.set_request_handler(Rc::new(move |session, method, id, params| {
        handler::handle_request(&handler_context, session, method, id, params);
    }));

    let id = registry.insert(endpoint.clone(), session);
    let registry = Rc::downgrade(registry);
    endpoint.set_status_handler(Rc::new(move |endpoint, error| {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        match error {
            None => {
                let peer = endpoint.peer_addr();
                registry.set_peer(id, peer);
                debug!("Connection {} open ({:?})", id, peer);
            }
            Some(e) => {
                info!("Connection {} ended: {}", id, e);
                registry.remove(id);
            }
        }
    }));
    endpoint
}

/// Polls the Ctrl-C flag on a reactor timer.
struct InterruptWatch {
    reactor: Rc<PollReactor>,
    interrupted: Arc<AtomicBool>,
    token: Cell<Option<TimerToken>>,
}

impl InterruptWatch {
    fn arm(self: &Rc<Self>) {
        if let Some(token) = self.token.take() {
            self.reactor.cancel(token);
        }
        let watch = Rc::downgrade(self);
        let token = self.reactor.schedule_once(
            INTERRUPT_POLL_INTERVAL,
            Box::new(move || {
                if let Some(watch) = watch.upgrade() {
                    watch.check();
                }
            }),
        );
        self.token.set(Some(token));
    }

    fn check(self: &Rc<Self>) {
        self.token.set(None);
        if self.interrupted.load(Ordering::SeqCst) {
            info!("Shutdown signal received, exiting");
            self.reactor.stop();
        } else {
            self.arm();
        }
    }
}

pub fn run(options: ServeOptions) -> Result<()> {
    info!("Starting Busgate RPC Server");

    let reactor = Rc::new(PollReactor::new());
    let registry = Rc::new(ConnectionRegistry::default());
    let context = Rc::new(ServerContext::new(reactor.clone(), &registry));

    let config = EndpointConfig::server(options.port)
        .with_max_connections(options.backlog)
        .with_allow_non_local(options.allow_non_local)
        .with_connection_limit_enforced(options.enforce_limit);
    let server = ConnectionEndpoint::new(reactor.clone(), config);
    server.set_status_handler(Rc::new(|_, error| {
        if let Some(e) = error {
            info!("Server stopped: {}", e);
        }
    }));

    let factory_registry = registry.clone();
    server.start_server(Rc::new(move |parent| {
        Some(spawn_connection(&context, &factory_registry, parent))
    }))?;
    let addr = server
        .local_addr()
        .context("Server socket has no local address")?;

    // Print port for the parent process to read (intentional stdout)
    println!("RPC_PORT={}", addr.port());
    std::io::stdout().flush()?;
    info!("RPC server running on {}", addr);

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Cannot install Ctrl-C handler")?;
    let watch = Rc::new(InterruptWatch {
        reactor: reactor.clone(),
        interrupted,
        token: Cell::new(None),
    });
    watch.arm();

    reactor.run()?;

    // Let queued replies, such as the answer to `shutdown`, go out first
    for endpoint in registry.endpoints() {
        endpoint.close_after_send();
    }
    if !reactor.run_until(|| registry.is_empty(), SHUTDOWN_DRAIN_TIMEOUT)? {
        warn!(
            "{} connection(s) still sending at shutdown, closing anyway",
            registry.len()
        );
    }

    server.close_connection();
    info!("Server shut down ({} connection(s) left)", registry.len());
    Ok(())
}
