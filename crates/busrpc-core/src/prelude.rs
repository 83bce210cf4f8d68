//! Common imports.
//!
//! ```rust
//! use busrpc_core::prelude::*;
//! ```

pub use crate::bus::{InMemoryBus, MessageBus};
pub use crate::codec::Message;
pub use crate::config::{ClientConfig, RequestOptions, SelectionConfig, ServerConfig};
pub use crate::error::{ErrorCode, RpcError, RpcResult};
pub use crate::ids::IdGenerator;
pub use crate::info::{topic, ServiceDefinition};
pub use crate::stream::Stream;
