//! Deployment Agent Library
//!
//! Receives tasks over pub/sub, runs their stages and reports logs upstream.

pub mod app;
pub mod cache;
pub mod deploy;
pub mod errors;
pub mod storage;
pub mod workers;
