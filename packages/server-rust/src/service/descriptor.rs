//! Registration descriptors.
//!
//! A service type declares its remotely callable operations by implementing
//! [`RpcService`]. Each declared method carries its parameter and return
//! slots as data, so the registry can apply the eligibility rules without
//! runtime reflection, and its arguments are decoded through the
//! [`ArgShape`] recorded for each parameter.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::dispatch::CallContext;
use crate::subscription::Subscription;

pub(crate) type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// One decoded argument, type-erased until the handler takes it back out.
pub type DecodedArg = Box<dyn Any + Send>;

type DecodeFn = fn(Value) -> Result<DecodedArg, serde_json::Error>;

/// What a handler produces on success.
pub enum Reply {
    /// No return value; encoded as `null`.
    Unit,
    /// A single return value, already in wire form.
    Value(Value),
    /// A live subscription. Only valid from subscription callbacks.
    Subscription(Subscription),
}

impl Reply {
    /// Serializes `value` into a [`Reply::Value`].
    ///
    /// # Errors
    ///
    /// Returns the serialization error if `value` cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<Self> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => f.write_str("Unit"),
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Subscription(s) => f.debug_tuple("Subscription").field(&s.id()).finish(),
        }
    }
}

/// Result of running a handler. `Err` maps to the method's error slot.
pub type HandlerResult = anyhow::Result<Reply>;

/// How an argument is passed. By-reference arguments are nullable and may be
/// omitted when trailing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Passing {
    ByValue,
    ByReference,
}

/// Shape of one decodable parameter: value kind plus its decode function.
#[derive(Clone, Copy)]
pub struct ArgShape {
    type_name: &'static str,
    passing: Passing,
    decode: DecodeFn,
}

impl ArgShape {
    /// A required argument decoded as `T`. Handlers take it with
    /// [`CallArgs::take::<T>`].
    #[must_use]
    pub fn value<T: DeserializeOwned + Send + 'static>() -> Self {
        Self {
            type_name: type_name::<T>(),
            passing: Passing::ByValue,
            decode: decode_as::<T>,
        }
    }

    /// A nullable argument decoded as `Option<T>`. Handlers take it with
    /// [`CallArgs::reference::<T>`].
    #[must_use]
    pub fn reference<T: DeserializeOwned + Send + 'static>() -> Self {
        Self {
            type_name: type_name::<T>(),
            passing: Passing::ByReference,
            decode: decode_as::<Option<T>>,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn passing(&self) -> Passing {
        self.passing
    }

    /// Whether the argument may be omitted from the wire payload.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.passing == Passing::ByReference
    }

    pub(crate) fn decode(&self, raw: Value) -> Result<DecodedArg, serde_json::Error> {
        (self.decode)(raw)
    }
}

impl fmt::Debug for ArgShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgShape")
            .field("type_name", &self.type_name)
            .field("passing", &self.passing)
            .finish_non_exhaustive()
    }
}

fn decode_as<T: DeserializeOwned + Send + 'static>(raw: Value) -> Result<DecodedArg, serde_json::Error> {
    serde_json::from_value::<T>(raw).map(|v| Box::new(v) as DecodedArg)
}

/// A declared parameter.
#[derive(Debug, Clone, Copy)]
pub enum ParamSlot {
    /// The call's cancellation scope. Never decoded from the wire.
    Context,
    Arg(ArgShape),
}

/// A declared return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnSlot {
    Value(&'static str),
    Error,
    Subscription,
}

impl ReturnSlot {
    #[must_use]
    pub fn value<T: Serialize>() -> Self {
        Self::Value(type_name::<T>())
    }
}

/// Whether a type or method is reachable from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Exported,
    Internal,
}

/// Errors raised while a handler unpacks its arguments.
#[derive(Debug, thiserror::Error)]
pub enum ArgError {
    #[error("argument {index} is missing or was already taken")]
    Missing { index: usize },
    #[error("argument {index} is not a {expected}")]
    TypeMismatch { index: usize, expected: &'static str },
    #[error("method was not declared with a context parameter")]
    MissingContext,
}

/// Decoded wire arguments, positionally matching the declared shapes.
#[derive(Default)]
pub struct CallArgs {
    slots: Vec<Option<DecodedArg>>,
}

impl CallArgs {
    pub(crate) fn new(decoded: Vec<DecodedArg>) -> Self {
        Self {
            slots: decoded.into_iter().map(Some).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Moves argument `index` out as `T`.
    ///
    /// # Errors
    ///
    /// `Missing` if the index is out of range or already taken,
    /// `TypeMismatch` if `T` is not the declared type.
    pub fn take<T: Any>(&mut self, index: usize) -> Result<T, ArgError> {
        let boxed = self
            .slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(ArgError::Missing { index })?;
        boxed
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| ArgError::TypeMismatch {
                index,
                expected: type_name::<T>(),
            })
    }

    /// Moves a by-reference argument out.
    ///
    /// # Errors
    ///
    /// Same as [`CallArgs::take`].
    pub fn reference<T: Any>(&mut self, index: usize) -> Result<Option<T>, ArgError> {
        self.take::<Option<T>>(index)
    }
}

impl fmt::Debug for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallArgs").field("len", &self.slots.len()).finish()
    }
}

/// Everything a handler receives for one call.
#[derive(Debug)]
pub struct Invocation {
    /// Present iff the method declared a leading context parameter.
    pub context: Option<CallContext>,
    pub args: CallArgs,
}

impl Invocation {
    /// # Errors
    ///
    /// `ArgError::MissingContext` if the method did not declare a context parameter.
    pub fn require_context(&self) -> Result<&CallContext, ArgError> {
        self.context.as_ref().ok_or(ArgError::MissingContext)
    }
}

type DeclHandler<T> = Arc<dyn Fn(Arc<T>, Invocation) -> BoxedFuture<HandlerResult> + Send + Sync>;

/// Declaration of one method on a service type `T`.
pub struct MethodDecl<T> {
    name: String,
    visibility: Visibility,
    params: Vec<ParamSlot>,
    returns: Vec<ReturnSlot>,
    handler: DeclHandler<T>,
}

impl<T: Send + Sync + 'static> MethodDecl<T> {
    /// Declares an exported method with no parameters and no return values.
    /// Chain [`context`](Self::context), [`arg`](Self::arg) and
    /// [`returns`](Self::returns) to complete the signature.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<T>, Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            visibility: Visibility::Exported,
            params: Vec::new(),
            returns: Vec::new(),
            handler: Arc::new(
                move |receiver: Arc<T>, call: Invocation| -> BoxedFuture<HandlerResult> {
                    Box::pin(handler(receiver, call))
                },
            ),
        }
    }

    /// Appends a cancellation-scope parameter.
    #[must_use]
    pub fn context(mut self) -> Self {
        self.params.push(ParamSlot::Context);
        self
    }

    #[must_use]
    pub fn arg(mut self, shape: ArgShape) -> Self {
        self.params.push(ParamSlot::Arg(shape));
        self
    }

    #[must_use]
    pub fn returns(mut self, slot: ReturnSlot) -> Self {
        self.returns.push(slot);
        self
    }

    /// Hides the method from the wire.
    #[must_use]
    pub fn internal(mut self) -> Self {
        self.visibility = Visibility::Internal;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    #[must_use]
    pub fn params(&self) -> &[ParamSlot] {
        &self.params
    }

    #[must_use]
    pub fn return_slots(&self) -> &[ReturnSlot] {
        &self.returns
    }

    pub(crate) fn bind(self, receiver: &Arc<T>) -> BoundMethod {
        let receiver = Arc::clone(receiver);
        let handler = self.handler;
        BoundMethod {
            name: self.name,
            visibility: self.visibility,
            params: self.params,
            returns: self.returns,
            handler: Arc::new(move |call: Invocation| handler(Arc::clone(&receiver), call)),
        }
    }
}

pub(crate) type ErasedHandler = Arc<dyn Fn(Invocation) -> BoxedFuture<HandlerResult> + Send + Sync>;

/// A method declaration with its receiver bound and its type erased.
pub(crate) struct BoundMethod {
    pub(crate) name: String,
    pub(crate) visibility: Visibility,
    pub(crate) params: Vec<ParamSlot>,
    pub(crate) returns: Vec<ReturnSlot>,
    pub(crate) handler: ErasedHandler,
}

/// The full declaration of a service object.
pub struct ServiceDescriptor<T> {
    receiver: Arc<T>,
    visibility: Visibility,
    methods: Vec<MethodDecl<T>>,
}

impl<T: Send + Sync + 'static> ServiceDescriptor<T> {
    /// Opts the type in to remote exposure.
    #[must_use]
    pub fn exported(receiver: Arc<T>) -> Self {
        Self {
            receiver,
            visibility: Visibility::Exported,
            methods: Vec::new(),
        }
    }

    /// A descriptor for a type that must not be exposed; registering it fails.
    #[must_use]
    pub fn internal(receiver: Arc<T>) -> Self {
        Self {
            receiver,
            visibility: Visibility::Internal,
            methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn method(mut self, decl: MethodDecl<T>) -> Self {
        self.methods.push(decl);
        self
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        TypeId::of::<T>()
    }

    #[must_use]
    pub fn is_exported(&self) -> bool {
        self.visibility == Visibility::Exported
    }

    #[must_use]
    pub fn methods(&self) -> &[MethodDecl<T>] {
        &self.methods
    }

    pub(crate) fn into_bound(self) -> (Arc<dyn Any + Send + Sync>, Vec<BoundMethod>) {
        let receiver = self.receiver;
        let methods = self
            .methods
            .into_iter()
            .map(|decl| decl.bind(&receiver))
            .collect();
        let erased: Arc<dyn Any + Send + Sync> = receiver;
        (erased, methods)
    }
}

/// Implemented by business objects that can be registered with a server.
pub trait RpcService: Send + Sync + Sized + 'static {
    /// Declares the callable surface of this object.
    fn describe(self: Arc<Self>) -> ServiceDescriptor<Self>;
}
