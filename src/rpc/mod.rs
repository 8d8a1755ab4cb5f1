//! Remote procedure calls between runtimes
//!
//! Requests are correlated with the frame that issued them. A frame may
//! address one peer or many, and chooses how many answers it waits for.

pub mod call;
pub mod codec;
pub mod header;
pub mod pending;
pub mod registry;
pub(crate) mod service;

pub use call::{Broadcast, Call, FinishCondition, RequestDescriptor, ResultCallback};
pub use header::{MessageType, WireHeader, HEADER_LEN, HEADER_MAGIC};
pub use pending::{PendingTable, RpcStats};
pub use registry::{FunctionRegistry, RemoteFn};
