//! # busrpc client
//!
//! Calls methods served by `busrpc-server` instances over the same bus:
//! unary calls with server selection, fan-out calls, bidirectional streams
//! and server-published notifications.

pub mod client;
pub mod select;

pub use client::{MultiResponse, Notifications, RpcClient};
pub use select::select_server;
