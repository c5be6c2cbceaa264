//! Eligibility rules and the stored form of a callable method.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::descriptor::{
    ArgShape, BoundMethod, BoxedFuture, ErasedHandler, HandlerResult, Invocation, ParamSlot,
    ReturnSlot, Visibility,
};
use super::naming::format_name;

/// Why a declared method was left out of the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Ineligible {
    #[error("method is not exported")]
    NotExported,
    #[error("context parameter may only appear first")]
    MisplacedContext,
    #[error("subscriptions must take a context and return (subscription, error)")]
    BadSubscriptionSignature,
    #[error("more than two return values")]
    TooManyReturns,
    #[error("second return value must be an error")]
    SecondReturnNotError,
}

/// Which catalogue a method lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Plain,
    Subscription,
}

/// Applies the registration rules to a method signature.
///
/// # Errors
///
/// Returns the first rule the signature violates.
pub fn classify(
    visibility: Visibility,
    params: &[ParamSlot],
    returns: &[ReturnSlot],
) -> Result<CallbackKind, Ineligible> {
    if visibility == Visibility::Internal {
        return Err(Ineligible::NotExported);
    }
    if params.iter().skip(1).any(|p| matches!(p, ParamSlot::Context)) {
        return Err(Ineligible::MisplacedContext);
    }
    let has_context = matches!(params.first(), Some(ParamSlot::Context));

    if returns.contains(&ReturnSlot::Subscription) {
        return if has_context && returns == [ReturnSlot::Subscription, ReturnSlot::Error] {
            Ok(CallbackKind::Subscription)
        } else {
            Err(Ineligible::BadSubscriptionSignature)
        };
    }

    match returns {
        [] | [_] | [ReturnSlot::Value(_), ReturnSlot::Error] => Ok(CallbackKind::Plain),
        [_, _] => Err(Ineligible::SecondReturnNotError),
        _ => Err(Ineligible::TooManyReturns),
    }
}

/// A registered method: its receiver, wire name and decode plan.
pub struct Callback {
    receiver: Arc<dyn Any + Send + Sync>,
    name: String,
    arg_shapes: Vec<ArgShape>,
    has_context_arg: bool,
    error_position: Option<usize>,
    kind: CallbackKind,
    handler: ErasedHandler,
}

impl Callback {
    /// Builds a callback if the bound method passes [`classify`].
    pub(crate) fn from_bound(
        receiver: &Arc<dyn Any + Send + Sync>,
        method: BoundMethod,
    ) -> Result<Self, (String, Ineligible)> {
        let kind = match classify(method.visibility, &method.params, &method.returns) {
            Ok(kind) => kind,
            Err(reason) => return Err((method.name, reason)),
        };
        let has_context_arg = matches!(method.params.first(), Some(ParamSlot::Context));
        let arg_shapes = method
            .params
            .iter()
            .filter_map(|p| match p {
                ParamSlot::Arg(shape) => Some(*shape),
                ParamSlot::Context => None,
            })
            .collect();
        let error_position = match method.returns.last() {
            Some(ReturnSlot::Error) => Some(method.returns.len() - 1),
            _ => None,
        };
        Ok(Self {
            receiver: Arc::clone(receiver),
            name: format_name(&method.name),
            arg_shapes,
            has_context_arg,
            error_position,
            kind,
            handler: method.handler,
        })
    }

    /// Wire name of the method.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decodable parameters, excluding the context slot.
    #[must_use]
    pub fn arg_shapes(&self) -> &[ArgShape] {
        &self.arg_shapes
    }

    #[must_use]
    pub fn has_context_arg(&self) -> bool {
        self.has_context_arg
    }

    /// Index of the error return slot, if declared.
    #[must_use]
    pub fn error_position(&self) -> Option<usize> {
        self.error_position
    }

    #[must_use]
    pub fn is_subscription(&self) -> bool {
        self.kind == CallbackKind::Subscription
    }

    #[must_use]
    pub fn receiver(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.receiver
    }

    pub(crate) fn call(&self, invocation: Invocation) -> BoxedFuture<HandlerResult> {
        (self.handler)(invocation)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.name)
            .field("arg_shapes", &self.arg_shapes)
            .field("has_context_arg", &self.has_context_arg)
            .field("error_position", &self.error_position)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
