//! Argument decoding and guarded handler execution.

use std::any::Any;
use std::time::Duration;

use callgate_core::RpcError;
use serde_json::Value;
use tokio_util::task::AbortOnDropHandle;

use super::context::CallContext;
use crate::service::descriptor::{CallArgs, Invocation, Reply};
use crate::service::Callback;

/// Decodes positional wire params against the callback's declared shapes.
///
/// `null` or absent params mean no arguments. Trailing by-reference
/// arguments may be omitted and decode as `None`.
///
/// # Errors
///
/// Returns an invalid-params error for non-array params, too many values,
/// a missing required value, or a value of the wrong kind.
pub fn decode_args(callback: &Callback, params: Option<Value>) -> Result<CallArgs, RpcError> {
    let shapes = callback.arg_shapes();
    let values = match params {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(values)) => values,
        Some(_) => return Err(RpcError::invalid_params("non-array args")),
    };
    if values.len() > shapes.len() {
        return Err(RpcError::invalid_params(format!(
            "too many arguments, want at most {}",
            shapes.len()
        )));
    }

    let mut values = values.into_iter();
    let mut decoded = Vec::with_capacity(shapes.len());
    for (index, shape) in shapes.iter().enumerate() {
        let raw = match values.next() {
            Some(raw) => raw,
            None if shape.is_optional() => Value::Null,
            None => {
                return Err(RpcError::invalid_params(format!(
                    "missing value for required argument {index}"
                )))
            }
        };
        let arg = shape
            .decode(raw)
            .map_err(|e| RpcError::invalid_params(format!("invalid argument {index}: {e}")))?;
        decoded.push(arg);
    }
    Ok(CallArgs::new(decoded))
}

/// Decodes params and runs the handler on its own task.
///
/// A panicking handler is turned into an internal error and never takes the
/// connection down. Dropping the returned future aborts the handler.
///
/// # Errors
///
/// Decode failures, handler errors, panics and timeouts, as wire errors.
pub async fn invoke(
    callback: &Callback,
    context: &CallContext,
    params: Option<Value>,
    timeout: Option<Duration>,
) -> Result<Reply, RpcError> {
    let args = decode_args(callback, params)?;
    let invocation = Invocation {
        context: callback.has_context_arg().then(|| context.clone()),
        args,
    };
    let task = AbortOnDropHandle::new(tokio::spawn(callback.call(invocation)));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                context.scope().cancel();
                let millis = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                return Err(RpcError::timeout(millis));
            }
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(error)) if callback.error_position().is_some() => {
            Err(RpcError::callback(error.to_string()))
        }
        Ok(Err(error)) => Err(RpcError::internal(format!(
            "method {} failed without an error result: {error}",
            callback.name()
        ))),
        Err(join) if join.is_panic() => Err(RpcError::internal(format!(
            "method handler crashed: {}",
            panic_message(join.into_panic())
        ))),
        Err(_) => Err(RpcError::internal("method handler was aborted")),
    }
}

/// Converts a reply into the wire result of a plain call.
pub(crate) fn reply_value(reply: Reply) -> Result<Value, RpcError> {
    match reply {
        Reply::Unit => Ok(Value::Null),
        Reply::Value(value) => Ok(value),
        Reply::Subscription(_) => Err(RpcError::internal(
            "plain method returned a subscription",
        )),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::service::ServiceRegistry;
    use crate::subscription::{Notifier, SubscriptionManager};
    use crate::test_support::{CalcService, FaultyService};

    fn registry() -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        registry.register("calc", Arc::new(CalcService)).unwrap();
        registry.register("faulty", Arc::new(FaultyService::default())).unwrap();
        registry
    }

    fn context() -> CallContext {
        let manager = Arc::new(SubscriptionManager::new(CancellationToken::new(), 8));
        CallContext::new(CancellationToken::new(), Notifier::new(manager, "calc"))
    }

    fn callback(registry: &ServiceRegistry, service: &str, method: &str) -> Arc<Callback> {
        Arc::clone(registry.lookup(service).unwrap().callback(method).unwrap())
    }

    async fn call(service: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        let registry = registry();
        let cb = callback(&registry, service, method);
        invoke(&cb, &context(), Some(params), None)
            .await
            .and_then(reply_value)
    }

    #[tokio::test]
    async fn decodes_and_runs() {
        assert_eq!(call("calc", "add", json!([2, 3])).await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn null_params_mean_no_args() {
        let registry = registry();
        let cb = callback(&registry, "calc", "noArgsRets");
        let result = invoke(&cb, &context(), None, None).await.unwrap();
        assert!(matches!(result, Reply::Unit));
    }

    #[tokio::test]
    async fn rejects_non_array_params() {
        let err = call("calc", "add", json!({"a": 1})).await.unwrap_err();
        assert_eq!(err.code, -32602);
        assert_eq!(err.message, "non-array args");
    }

    #[tokio::test]
    async fn rejects_too_many_args() {
        let err = call("calc", "add", json!([1, 2, 3])).await.unwrap_err();
        assert_eq!(err.code, -32602);
        assert_eq!(err.message, "too many arguments, want at most 2");
    }

    #[tokio::test]
    async fn rejects_missing_required_arg() {
        let err = call("calc", "add", json!([1])).await.unwrap_err();
        assert_eq!(err.code, -32602);
        assert_eq!(err.message, "missing value for required argument 1");
    }

    #[tokio::test]
    async fn rejects_wrong_kind() {
        let err = call("calc", "add", json!(["one", 2])).await.unwrap_err();
        assert_eq!(err.code, -32602);
        assert!(err.message.starts_with("invalid argument 0:"), "{}", err.message);
    }

    #[tokio::test]
    async fn omitted_trailing_reference_is_none() {
        let value = call("calc", "echo", json!(["x", 1])).await.unwrap();
        assert_eq!(value, json!({"string": "x", "int": 1, "args": null}));
    }

    #[tokio::test]
    async fn handler_error_maps_to_callback_error() {
        let err = call("calc", "div", json!([1, 0])).await.unwrap_err();
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "division by zero");
    }

    #[tokio::test]
    async fn panic_is_isolated() {
        let err = call("faulty", "panics", json!([])).await.unwrap_err();
        assert_eq!(err.code, -32603);
        assert!(err.message.contains("boom"), "{}", err.message);
    }

    #[tokio::test]
    async fn error_without_error_slot_is_internal() {
        let err = call("faulty", "failsSilently", json!([])).await.unwrap_err();
        assert_eq!(err.code, -32603);
    }

    #[tokio::test]
    async fn timeout_cancels_scope() {
        let registry = registry();
        let cb = callback(&registry, "calc", "sleep");
        let ctx = context();
        let err = invoke(&cb, &ctx, Some(json!([5_000])), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.code, -32002);
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn panic_message_variants() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic");
    }
}
