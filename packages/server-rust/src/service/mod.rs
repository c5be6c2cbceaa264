//! Service registration.
//!
//! 1. **Declaration** (`descriptor`): service types describe their methods as data
//! 2. **Eligibility** (`callback`): which declared methods become callable
//! 3. **Catalogue** (`catalogue`, `registry`): name-keyed, mergeable method tables
//! 4. **Metadata** (`builtin`): the `rpc` service listing registered modules

pub mod builtin;
pub mod callback;
pub mod catalogue;
pub mod descriptor;
pub mod naming;
pub mod registry;

pub use builtin::{RpcInfo, METADATA_SERVICE, MODULE_VERSION};
pub use callback::{classify, Callback, CallbackKind, Ineligible};
pub use catalogue::ServiceCatalogue;
pub use descriptor::{
    ArgError, ArgShape, CallArgs, DecodedArg, HandlerResult, Invocation, MethodDecl, ParamSlot,
    Passing, Reply, ReturnSlot, RpcService, ServiceDescriptor, Visibility,
};
pub use naming::{format_name, split_method_ref, SERVICE_METHOD_SEPARATOR};
pub use registry::{RegistrationError, ServiceRegistry};
