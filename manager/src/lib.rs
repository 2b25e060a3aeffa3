//! Deployment Manager Library
//!
//! Accepts orders over HTTP, resolves their targets, dispatches tasks over
//! the broker and collects what the fleet reports back.

pub mod app;
pub mod dispatch;
pub mod errors;
pub mod server;
pub mod storage;
pub mod workers;
