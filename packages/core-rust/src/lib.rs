//! `callgate` core: call identifiers, the wire error taxonomy, the codec
//! boundary consumed by the dispatcher, and a line-delimited JSON-RPC codec.

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{CodecError, JsonCodec, JsonCodecConfig, ReadError, ServerCodec};
pub use error::{codes, RpcError};
pub use types::{CallId, Request, SubscriptionId};
