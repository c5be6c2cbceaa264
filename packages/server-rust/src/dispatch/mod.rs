//! Request dispatch: per-call context, argument decoding, and the
//! per-connection read loop.

pub mod context;
pub mod dispatcher;
pub mod invoke;

pub use context::CallContext;
pub use dispatcher::{Dispatcher, SessionEnd, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD};
pub use invoke::{decode_args, invoke};
