//! JSON-RPC 2.0 session over one channel.

use super::message::{
    format_error_code, RpcMessage, RpcRequest, RpcResponse, INTERNAL_ERROR, METHOD_NOT_FOUND,
    PARSE_ERROR, SERVER_ERROR,
};
use crate::channel::{Channel, DecodeError, DecodeErrorKind};
use crate::{GatewayError, Result};
use regex::Regex;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Lenient match for an `"id"` member in bytes that did not parse.
static SALVAGE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""id"\s*:\s*(-?\d+(?:\.\d+)?|"(?:[^"\\]|\\.)*")"#).unwrap());

/// Called once with the outcome of an outgoing request: the derived error,
/// if any, and the result (or the error's `data`).
pub type ResponseHandler = Box<dyn FnOnce(&RpcSession, Option<GatewayError>, Option<Value>)>;

/// Called for every valid incoming request or notification with
/// `(session, method, id, params)`. A notification has no id.
pub type RequestHandler = Rc<dyn Fn(&RpcSession, &str, Option<Value>, Option<Value>)>;

struct SessionState {
    next_id: u32,
    pending: BTreeMap<u32, ResponseHandler>,
    request_handler: Option<RequestHandler>,
}

struct SessionInner {
    channel: Rc<dyn Channel>,
    state: RefCell<SessionState>,
}

/// One JSON-RPC protocol instance bound to a channel.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct RpcSession {
    inner: Rc<SessionInner>,
}

impl RpcSession {
    /// Bind a session to `channel`, taking over its message and detach
    /// handlers.
    pub fn new(channel: Rc<dyn Channel>) -> Self {
        let session = Self {
            inner: Rc::new(SessionInner {
                channel: channel.clone(),
                state: RefCell::new(SessionState {
                    next_id: 0,
                    pending: BTreeMap::new(),
                    request_handler: None,
                }),
            }),
        };

        let weak = Rc::downgrade(&session.inner);
        channel.set_message_handler(Rc::new(move |message| {
            if let Some(session) = Self::from_weak(&weak) {
                session.dispatch(message);
            }
        }));
        let weak = Rc::downgrade(&session.inner);
        channel.set_detach_handler(Rc::new(move || {
            if let Some(session) = Self::from_weak(&weak) {
                session.fail_pending();
            }
        }));
        session
    }

    fn from_weak(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn set_request_handler(&self, handler: RequestHandler) {
        self.inner.state.borrow_mut().request_handler = Some(handler);
    }

    pub fn has_request_handler(&self) -> bool {
        self.inner.state.borrow().request_handler.is_some()
    }

    /// Outgoing requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.state.borrow().pending.len()
    }

    pub fn channel(&self) -> Rc<dyn Channel> {
        self.inner.channel.clone()
    }

    /// Send a request, or a notification when no handler is given.
    ///
    /// Returns the id allocated for the request. Ids increase by one per
    /// request and wrap at `u32::MAX`.
    pub fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        handler: Option<ResponseHandler>,
    ) -> Result<Option<u32>> {
        let id = handler.map(|handler| {
            let mut state = self.inner.state.borrow_mut();
            state.next_id = state.next_id.wrapping_add(1);
            let id = state.next_id;
            state.pending.insert(id, handler);
            id
        });

        let request = RpcRequest::new(method, params, id);
        debug!(method, ?id, "sending JSON-RPC request");
        if let Err(e) = self.send_envelope(&request) {
            if let Some(id) = id {
                self.inner.state.borrow_mut().pending.remove(&id);
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Answer a request with a result. `id` is echoed as received.
    pub fn send_result(&self, id: Value, result: Value) -> Result<()> {
        self.send_envelope(&RpcResponse::success(id, result))
    }

    /// Answer a request with an error.
    ///
    /// A missing `id` is sent as `null`; a missing message is derived from
    /// the code.
    pub fn send_error(
        &self,
        id: Option<Value>,
        code: i32,
        message: Option<&str>,
        data: Option<Value>,
    ) -> Result<()> {
        let message = message.map_or_else(|| format_error_code(code), str::to_string);
        self.send_envelope(&RpcResponse::error(id, code, message, data))
    }

    /// Answer a request with the outcome of a handler.
    ///
    /// Does nothing for notifications.
    pub fn respond(&self, id: Option<Value>, outcome: Result<Value>) -> Result<()> {
        let Some(id) = id else {
            if let Err(e) = outcome {
                debug!("Notification failed: {}", e);
            }
            return Ok(());
        };
        match outcome {
            Ok(result) => self.send_result(id, result),
            Err(GatewayError::Rpc {
                code,
                message,
                data,
            }) => self.send_error(Some(id), code, Some(&message), data),
            Err(e) => self.send_error(Some(id), e.to_rpc_error_code(), Some(&e.to_string()), None),
        }
    }

    /// Fail every pending request with `ConnectionClosed`, in id order.
    ///
    /// The channel itself is left alone.
    pub fn close(&self) {
        self.fail_pending();
    }

    fn send_envelope<T: serde::Serialize>(&self, envelope: &T) -> Result<()> {
        let value = serde_json::to_value(envelope)?;
        self.inner.channel.send(&value)
    }

    fn fail_pending(&self) {
        let pending = std::mem::take(&mut self.inner.state.borrow_mut().pending);
        if !pending.is_empty() {
            debug!("Failing {} pending request(s)", pending.len());
        }
        for (_, handler) in pending {
            handler(self, Some(GatewayError::ConnectionClosed), None);
        }
    }

    fn dispatch(&self, message: std::result::Result<Value, DecodeError>) {
        let value = match message {
            Ok(value) => value,
            Err(e) => return self.reject_undecodable(e),
        };

        match RpcMessage::from_value(value) {
            Err(invalid) => {
                warn!("JSON-RPC error: {}", invalid.message);
                self.reply_error(invalid.id, invalid.code, &invalid.message);
            }
            Ok(RpcMessage::Request { method, id, params }) => {
                let handler = self.inner.state.borrow().request_handler.clone();
                match handler {
                    Some(handler) => handler(self, &method, id, params),
                    None if id.is_some() => self.reply_error(id, METHOD_NOT_FOUND, "Method not found"),
                    None => debug!(method = %method, "Dropping notification: no request handler"),
                }
            }
            Ok(RpcMessage::Response { id, result }) => self.complete(id, None, Some(result)),
            Ok(RpcMessage::ErrorResponse {
                id,
                code,
                message,
                data,
            }) => {
                let error = GatewayError::Rpc {
                    code,
                    message,
                    data: data.clone(),
                };
                self.complete(id, Some(error), data);
            }
        }
    }

    fn reject_undecodable(&self, error: DecodeError) {
        let code = match error.kind {
            DecodeErrorKind::Parse => PARSE_ERROR,
            DecodeErrorKind::Transport => SERVER_ERROR,
        };
        match salvage_id(&error.partial) {
            Some(id) => {
                warn!("Undecodable message (id {}): {}", id, error.message);
                self.reply_error(Some(id), code, &error.message);
            }
            None => warn!("Undecodable message without id: {}", error.message),
        }
    }

    fn reply_error(&self, id: Option<Value>, code: i32, message: &str) {
        if let Err(e) = self.send_error(id, code, Some(message), None) {
            warn!("Cannot send JSON-RPC error {}: {}", code, e);
        }
    }

    fn complete(&self, id: Option<Value>, error: Option<GatewayError>, value: Option<Value>) {
        let Some(id) = id else {
            warn!(
                "JSON-RPC error: Received response with no 'id'{}",
                error.map(|e| format!(": {}", e)).unwrap_or_default()
            );
            return;
        };

        let handler = id
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .and_then(|n| self.inner.state.borrow_mut().pending.remove(&n));
        match handler {
            Some(handler) => handler(self, error, value),
            None => warn!("JSON-RPC error: Received response with unknown 'id'={}", id),
        }
    }
}

/// Recover an id from a message that could not be decoded.
fn salvage_id(partial: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(partial);
    let captures = SALVAGE_ID_RE.captures(&text)?;
    serde_json::from_str(captures.get(1)?.as_str()).ok()
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self
            .inner
            .state
            .try_borrow()
            .map(|s| s.pending.len())
            .unwrap_or_default();
        f.debug_struct("RpcSession")
            .field("attached", &self.inner.channel.is_attached())
            .field("pending", &pending)
            .finish()
    }
}

/// Build an internal-error outcome for request handlers.
pub fn internal_error(message: impl Into<String>) -> GatewayError {
    GatewayError::rpc(INTERNAL_ERROR, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::JsonChannel;
    use crate::reactor::PollReactor;
    use serde_json::json;
    use socket2::Socket;
    use std::cell::Cell;
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Peer {
        reactor: Rc<PollReactor>,
        session: RpcSession,
        channel: JsonChannel,
        stream: UnixStream,
    }

    impl Peer {
        fn new() -> Self {
            let reactor = Rc::new(PollReactor::new());
            let channel = JsonChannel::new(reactor.clone());
            let (local, stream) = UnixStream::pair().unwrap();
            local.set_nonblocking(true).unwrap();
            stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
            channel.attach(Rc::new(Socket::from(local)), Rc::new(|_, _| {}));
            let session = RpcSession::new(Rc::new(channel.clone()));
            Self {
                reactor,
                session,
                channel,
                stream,
            }
        }

        fn write(&mut self, message: Value) {
            let payload = serde_json::to_vec(&message).unwrap();
            self.write_raw(&payload);
        }

        fn write_raw(&mut self, payload: &[u8]) {
            self.stream.write_all(&(payload.len() as u32).to_be_bytes()).unwrap();
            self.stream.write_all(payload).unwrap();
        }

        /// Next frame from the session, or `None` if nothing arrives.
        fn read(&mut self) -> Option<Value> {
            let mut len_buf = [0u8; 4];
            match self.stream.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return None
                }
                Err(e) => panic!("read failed: {}", e),
            }
            let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            self.stream.read_exact(&mut payload).unwrap();
            Some(serde_json::from_slice(&payload).unwrap())
        }

        fn pump(&self) {
            self.reactor.run_until(|| false, Duration::from_millis(30)).unwrap();
        }
    }

    type Outcomes = Rc<RefCell<Vec<(Option<String>, Option<Value>)>>>;

    fn recording_handler(outcomes: &Outcomes) -> ResponseHandler {
        let outcomes = outcomes.clone();
        Box::new(move |_, error, value| {
            outcomes
                .borrow_mut()
                .push((error.map(|e| e.to_string()), value));
        })
    }

    #[test]
    fn test_ping_round_trip_and_duplicate_dropped() {
        let mut peer = Peer::new();
        let outcomes: Outcomes = Rc::default();

        let id = peer
            .session
            .send_request("ping", None, Some(recording_handler(&outcomes)))
            .unwrap();
        assert_eq!(id, Some(1));
        assert_eq!(
            peer.read(),
            Some(json!({"jsonrpc": "2.0", "method": "ping", "id": 1}))
        );

        peer.write(json!({"jsonrpc": "2.0", "result": "pong", "id": 1}));
        let seen = outcomes.clone();
        assert!(peer.reactor.run_until(|| !seen.borrow().is_empty(), TIMEOUT).unwrap());
        assert_eq!(peer.session.pending_count(), 0);

        peer.write(json!({"jsonrpc": "2.0", "result": "pong", "id": 1}));
        peer.pump();
        assert_eq!(*outcomes.borrow(), vec![(None, Some(json!("pong")))]);
    }

    #[test]
    fn test_bad_version_rejected_before_handler() {
        let mut peer = Peer::new();
        let called = Rc::new(Cell::new(false));
        let flag = called.clone();
        peer.session
            .set_request_handler(Rc::new(move |_, _, _, _| flag.set(true)));

        peer.write(json!({"method": "ping", "id": 3}));
        peer.pump();
        let reply = peer.read().unwrap();
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["id"], json!(3));
        assert_eq!(peer.read(), None);

        peer.write(json!({"jsonrpc": "1.0", "method": "ping"}));
        peer.pump();
        let reply = peer.read().unwrap();
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["id"], Value::Null);
        assert!(!called.get());
    }

    #[test]
    fn test_response_with_bad_version_answered_and_left_pending() {
        let mut peer = Peer::new();
        let outcomes: Outcomes = Rc::default();
        peer.session
            .send_request("ping", None, Some(recording_handler(&outcomes)))
            .unwrap();
        peer.read().unwrap();

        peer.write(json!({"result": "pong", "id": 1}));
        peer.pump();
        let reply = peer.read().unwrap();
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["id"], json!(1));
        assert!(outcomes.borrow().is_empty());
        assert_eq!(peer.session.pending_count(), 1);

        // A versioned response with an unusable id is dropped silently
        peer.write(json!({"jsonrpc": "2.0", "result": "pong", "id": "one"}));
        peer.pump();
        assert_eq!(peer.read(), None);
        assert_eq!(peer.session.pending_count(), 1);
    }

    #[test]
    fn test_failing_notification_produces_no_output() {
        let mut peer = Peer::new();
        peer.session.set_request_handler(Rc::new(|session, _, id, _| {
            session
                .respond(id, Err(internal_error("device offline")))
                .unwrap();
        }));

        peer.write(json!({"jsonrpc": "2.0", "method": "dim", "params": [50]}));
        peer.pump();
        assert_eq!(peer.read(), None);
    }

    #[test]
    fn test_request_without_handler_gets_method_not_found() {
        let mut peer = Peer::new();
        assert!(!peer.session.has_request_handler());

        peer.write(json!({"jsonrpc": "2.0", "method": "dim", "id": "a-7"}));
        peer.pump();
        let reply = peer.read().unwrap();
        assert_eq!(reply["error"]["code"], json!(-32601));
        assert_eq!(reply["id"], json!("a-7"));

        // Notifications without a handler are dropped silently
        peer.write(json!({"jsonrpc": "2.0", "method": "dim"}));
        peer.pump();
        assert_eq!(peer.read(), None);
    }

    #[test]
    fn test_handler_answers_with_echoed_id() {
        let mut peer = Peer::new();
        peer.session.set_request_handler(Rc::new(|session, method, id, params| {
            let outcome = match method {
                "echo" => Ok(params.unwrap_or(Value::Null)),
                _ => Err(GatewayError::rpc(METHOD_NOT_FOUND, "Method not found")),
            };
            session.respond(id, outcome).unwrap();
        }));

        peer.write(json!({"jsonrpc": "2.0", "method": "echo", "params": {"level": 3}, "id": 12}));
        peer.pump();
        assert_eq!(
            peer.read(),
            Some(json!({"jsonrpc": "2.0", "result": {"level": 3}, "id": 12}))
        );
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut peer = Peer::new();
        let outcomes: Outcomes = Rc::default();
        let ids: Vec<u32> = (0..5)
            .map(|_| {
                peer.session
                    .send_request("status", None, Some(recording_handler(&outcomes)))
                    .unwrap()
                    .unwrap()
            })
            .collect();

        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(peer.session.pending_count(), 5);
        for id in ids {
            assert_eq!(peer.read().unwrap()["id"], json!(id));
        }

        // Notifications carry no id and leave nothing pending
        assert_eq!(peer.session.send_request("tick", None, None).unwrap(), None);
        assert!(peer.read().unwrap().get("id").is_none());
        assert_eq!(peer.session.pending_count(), 5);
    }

    #[test]
    fn test_detach_fails_pending_in_id_order() {
        let peer = Peer::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for label in ["first", "second"] {
            let order = order.clone();
            peer.session
                .send_request(
                    "status",
                    None,
                    Some(Box::new(move |_, error, _| {
                        assert!(matches!(error, Some(GatewayError::ConnectionClosed)));
                        order.borrow_mut().push(label);
                    })),
                )
                .unwrap();
        }

        peer.channel.detach();
        assert_eq!(*order.borrow(), vec!["first", "second"]);
        assert_eq!(peer.session.pending_count(), 0);

        let result = peer.session.send_request("status", None, Some(Box::new(|_, _, _| {})));
        assert!(matches!(result, Err(GatewayError::NotConnected)));
        assert_eq!(peer.session.pending_count(), 0);
    }

    #[test]
    fn test_error_response_surfaces_code_and_data() {
        let mut peer = Peer::new();
        let outcomes: Outcomes = Rc::default();
        peer.session
            .send_request("dim", Some(json!([120])), Some(recording_handler(&outcomes)))
            .unwrap();
        peer.read().unwrap();

        peer.write(json!({
            "jsonrpc": "2.0",
            "error": {"code": -32602, "message": "level out of range", "data": {"max": 100}},
            "id": 1
        }));
        let seen = outcomes.clone();
        assert!(peer.reactor.run_until(|| !seen.borrow().is_empty(), TIMEOUT).unwrap());

        let (error, data) = outcomes.borrow()[0].clone();
        assert_eq!(
            error.as_deref(),
            Some("JSON-RPC error -32602: level out of range")
        );
        assert_eq!(data, Some(json!({"max": 100})));
    }

    #[test]
    fn test_parse_error_answered_only_with_salvaged_id() {
        let mut peer = Peer::new();

        peer.write_raw(br#"{"jsonrpc": "2.0", "id": 42, "method": "dim", "params": [1,"#);
        peer.pump();
        let reply = peer.read().unwrap();
        assert_eq!(reply["error"]["code"], json!(-32700));
        assert_eq!(reply["id"], json!(42));

        peer.write_raw(b"not json at all");
        peer.pump();
        assert_eq!(peer.read(), None);
    }

    #[test]
    fn test_send_error_default_message() {
        let mut peer = Peer::new();
        peer.session.send_error(Some(json!(5)), -32000, None, None).unwrap();
        let reply = peer.read().unwrap();
        assert_eq!(reply["error"]["message"], json!("Error code -32000 (0xFFFF8300)"));
    }

    #[test]
    fn test_salvage_id() {
        assert_eq!(salvage_id(br#"{"id": 7, "x": "#), Some(json!(7)));
        assert_eq!(salvage_id(br#"{"id":"req-\"1\"","#), Some(json!("req-\"1\"")));
        assert_eq!(salvage_id(b"garbage"), None);
    }
}
