//! # busrpc server
//!
//! Serves a service's methods over a message bus. Any number of server
//! processes may subscribe to the same method; for each request or stream
//! open they race through the claim protocol and the caller picks exactly
//! one of them to execute it.
//!
//! ## Lifecycle
//!
//! - [`RpcServer::register_handler`] / [`RpcServer::register_stream_handler`]
//!   subscribe a handler and start its receive loop.
//! - [`RpcServer::deregister_handler`] force-closes one handler.
//! - [`RpcServer::close`] closes every handler, gracefully or forcibly.

mod claim;
pub mod handler;
pub mod server;
pub mod stream_handler;

pub use handler::{AffinityFn, HandlerFn};
pub use server::RpcServer;
pub use stream_handler::{StreamAffinityFn, StreamHandlerFn};
