//! One-shot JSON-RPC client with connection retry.
//!
//! Retries are scheduled on the reactor with exponential backoff; the
//! pending retry timer is always cancelled before a new one is armed.

use anyhow::Result;
use busgate_core::{
    Channel, ConnectionEndpoint, EndpointConfig, ErrorCategory, GatewayError, JsonChannel,
    PollReactor, Reactor, RpcSession, TimerToken, WeakEndpoint,
};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound for the delay between connection attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub struct CallOptions {
    pub host: String,
    pub port: String,
    pub method: String,
    pub params: Option<Value>,
    pub notify: bool,
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

/// Delay before retry number `attempt` (1-based).
fn retry_delay(initial: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    initial.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

struct CallState {
    reactor: Rc<PollReactor>,
    session: RpcSession,
    options: CallOptions,
    failures: Cell<u32>,
    retry_token: Cell<Option<TimerToken>>,
    timeout_token: Cell<Option<TimerToken>>,
    connected: Cell<bool>,
    /// A notification is queued and the connection closes once it is out.
    draining: Cell<bool>,
    outcome: RefCell<Option<busgate_core::Result<Value>>>,
}

impl CallState {
    fn on_status(self: &Rc<Self>, endpoint: &ConnectionEndpoint, error: Option<&GatewayError>) {
        match error {
            None => {
                self.connected.set(true);
                info!("Connected to {}", self.target());
                self.send(endpoint);
            }
            Some(GatewayError::Closed) if self.draining.get() => self.finish(Ok(Value::Null)),
            Some(e) if self.draining.get() => self.finish(Err(GatewayError::HungUp(format!(
                "notification not delivered: {}",
                e
            )))),
            // Once open, the outcome comes from the response handler
            Some(_) if self.connected.get() => {}
            Some(e) => self.connect_failed(endpoint.downgrade(), e),
        }
    }

    fn connect_failed(self: &Rc<Self>, endpoint: WeakEndpoint, error: &GatewayError) {
        let failures = self.failures.get() + 1;
        self.failures.set(failures);
        // Raw socket errors such as a refused connect are worth retrying too
        let retryable = error.is_retryable() || error.category() == ErrorCategory::Transport;
        if failures > self.options.retries || !retryable {
            self.finish(Err(GatewayError::NoConnection {
                target: format!("{} ({})", self.target(), error),
            }));
            return;
        }

        let delay = retry_delay(self.options.retry_delay, failures);
        warn!(
            "Connection to {} failed: {}; retry {}/{} in {:?}",
            self.target(),
            error,
            failures,
            self.options.retries,
            delay
        );
        if let Some(token) = self.retry_token.take() {
            self.reactor.cancel(token);
        }
        let token = self.reactor.schedule_once(
            delay,
            Box::new(move || {
                if let Some(endpoint) = endpoint.upgrade() {
                    if let Err(e) = endpoint.initiate_connection() {
                        // Already reported through the status handler
                        debug!("Retry failed immediately: {}", e);
                    }
                }
            }),
        );
        self.retry_token.set(Some(token));
    }

    fn send(self: &Rc<Self>, endpoint: &ConnectionEndpoint) {
        let method = self.options.method.clone();
        let params = self.options.params.clone();

        if self.options.notify {
            match self.session.send_request(&method, params, None) {
                Ok(_) => {
                    // Finished by the Closed report once the bytes are out
                    self.draining.set(true);
                    endpoint.close_after_send();
                }
                Err(e) => self.finish(Err(e)),
            }
            return;
        }

        let state = Rc::downgrade(self);
        let sent = self.session.send_request(
            &method,
            params,
            Some(Box::new(move |_, error, value| {
                if let Some(state) = state.upgrade() {
                    state.finish(match error {
                        Some(e) => Err(e),
                        None => Ok(value.unwrap_or(Value::Null)),
                    });
                }
            })),
        );
        if let Err(e) = sent {
            self.finish(Err(e));
        }
    }

    fn finish(&self, outcome: busgate_core::Result<Value>) {
        if self.outcome.borrow().is_some() {
            return;
        }
        *self.outcome.borrow_mut() = Some(outcome);
        for token in [self.retry_token.take(), self.timeout_token.take()]
            .into_iter()
            .flatten()
        {
            self.reactor.cancel(token);
        }
        self.reactor.stop();
    }

    fn target(&self) -> String {
        format!("{}:{}", self.options.host, self.options.port)
    }
}

/// Connect, send the request and wait for its outcome.
pub fn run(options: CallOptions) -> Result<Value> {
    let reactor = Rc::new(PollReactor::new());
    let channel: Rc<dyn Channel> = Rc::new(JsonChannel::new(reactor.clone()));
    let session = RpcSession::new(channel.clone());

    let endpoint = ConnectionEndpoint::new(
        reactor.clone(),
        EndpointConfig::client(options.host.clone(), options.port.clone()),
    );
    endpoint.set_channel(channel);

    let timeout = options.timeout;
    let state = Rc::new(CallState {
        reactor: reactor.clone(),
        session,
        options,
        failures: Cell::new(0),
        retry_token: Cell::new(None),
        timeout_token: Cell::new(None),
        connected: Cell::new(false),
        draining: Cell::new(false),
        outcome: RefCell::new(None),
    });

    let status_state = state.clone();
    endpoint.set_status_handler(Rc::new(move |endpoint, error| {
        status_state.on_status(endpoint, error);
    }));

    let timeout_state = Rc::downgrade(&state);
    let token = reactor.schedule_once(
        timeout,
        Box::new(move || {
            if let Some(state) = timeout_state.upgrade() {
                state.timeout_token.set(None);
                state.finish(Err(GatewayError::HungUp(format!(
                    "no response within {:?}",
                    timeout
                ))));
            }
        }),
    );
    state.timeout_token.set(Some(token));

    if let Err(e) = endpoint.initiate_connection() {
        debug!("Connect failed immediately: {}", e);
    }
    if state.outcome.borrow().is_none() {
        reactor.run()?;
    }

    endpoint.close_connection();
    let outcome = state.outcome.borrow_mut().take();
    match outcome {
        Some(outcome) => Ok(outcome?),
        None => anyhow::bail!("Call ended without an outcome"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let initial = Duration::from_millis(100);
        assert_eq!(retry_delay(initial, 1), Duration::from_millis(100));
        assert_eq!(retry_delay(initial, 2), Duration::from_millis(200));
        assert_eq!(retry_delay(initial, 4), Duration::from_millis(800));
        assert_eq!(retry_delay(initial, 40), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_notification_is_written_before_close() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            received
        });

        let result = run(CallOptions {
            host: "127.0.0.1".into(),
            port: port.to_string(),
            method: "dim_all".into(),
            params: Some(serde_json::json!([10])),
            notify: true,
            retries: 0,
            retry_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        });
        assert_eq!(result.unwrap(), Value::Null);

        let received = peer.join().unwrap();
        let len = u32::from_be_bytes(received[..4].try_into().unwrap()) as usize;
        assert_eq!(received.len(), 4 + len);
        let message: Value = serde_json::from_slice(&received[4..]).unwrap();
        assert_eq!(message["method"], "dim_all");
        assert_eq!(message["params"], serde_json::json!([10]));
        assert!(message.get("id").is_none());
    }

    #[test]
    fn test_unreachable_server_fails_after_retries() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = run(CallOptions {
            host: "127.0.0.1".into(),
            port: port.to_string(),
            method: "ping".into(),
            params: None,
            notify: false,
            retries: 2,
            retry_delay: Duration::from_millis(5),
            timeout: Duration::from_secs(5),
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains("No connection"), "got: {}", err);
    }
}
