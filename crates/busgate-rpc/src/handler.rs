//! JSON-RPC request handlers.

use crate::server::ServerContext;
use busgate_core::rpc::METHOD_NOT_FOUND;
use busgate_core::{GatewayError, RpcSession};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

/// Answer one incoming request or notification.
pub fn handle_request(
    context: &ServerContext,
    session: &RpcSession,
    method: &str,
    id: Option<Value>,
    params: Option<Value>,
) {
    debug!("RPC call: {}({:?})", method, params);

    let result = dispatch_method(context, method, params);
    if let Err(e) = &result {
        warn!("RPC error for {}: {}", method, e);
    }
    if let Err(e) = session.respond(id, result) {
        error!("Cannot answer {}: {}", method, e);
    }

    // The reply is queued; the server drains connections once the reactor stops
    if method == "shutdown" {
        context.reactor.stop();
    }
}

fn dispatch_method(
    context: &ServerContext,
    method: &str,
    params: Option<Value>,
) -> busgate_core::Result<Value> {
    match method {
        "ping" => Ok(json!("pong")),
        "echo" => Ok(params.unwrap_or(Value::Null)),
        "health_check" => Ok(json!({"status": "ok"})),
        "list_connections" => Ok(json!({
            "count": context.connection_count(),
            "peers": context.peers(),
        })),
        "shutdown" => Ok(json!({"status": "shutting_down"})),
        _ => Err(GatewayError::rpc(
            METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ConnectionRegistry;
    use busgate_core::PollReactor;
    use std::rc::Rc;

    fn context() -> (ServerContext, Rc<ConnectionRegistry>) {
        let registry = Rc::new(ConnectionRegistry::default());
        let context = ServerContext::new(Rc::new(PollReactor::new()), &registry);
        (context, registry)
    }

    #[test]
    fn test_builtin_methods() {
        let (context, _registry) = context();
        assert_eq!(dispatch_method(&context, "ping", None).unwrap(), json!("pong"));
        assert_eq!(
            dispatch_method(&context, "echo", Some(json!({"a": [1, 2]}))).unwrap(),
            json!({"a": [1, 2]})
        );
        assert_eq!(dispatch_method(&context, "echo", None).unwrap(), Value::Null);
        assert_eq!(
            dispatch_method(&context, "health_check", None).unwrap(),
            json!({"status": "ok"})
        );
        assert_eq!(
            dispatch_method(&context, "list_connections", None).unwrap(),
            json!({"count": 0, "peers": []})
        );
    }

    #[test]
    fn test_unknown_method() {
        let (context, _registry) = context();
        let err = dispatch_method(&context, "dim_all", None).unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32601);
    }
}
