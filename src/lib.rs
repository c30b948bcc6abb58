//! This crate layers request/reply correlation, windowed batch submission and
//! safe session sharing on top of one-way message passing over an
//! asynchronous message queue.
//!
//! A caller obtains a [`session::Session`] from a [`connection::Connection`]
//! (directly, or borrowed from a [`pool::SessionPool`]), builds a
//! [`requestor::Requestor`] or [`batch::BatchRequestor`] against a target
//! address, and on the serving side runs a [`server::Server`] loop over an
//! input queue. Push-style consumption is available through
//! [`dispatch::Dispatcher`] instead of an explicit receive loop.
pub mod batch;
pub(crate) mod broker;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod message;
pub mod pool;
pub mod requestor;
pub mod server;
pub mod session;
