//! Shared building blocks of the deployment manager and agent: the wire
//! model, `topic:payload` framing, artifact archives and the pub/sub
//! transport.

pub mod archive;
pub mod errors;
pub mod filesys;
pub mod frame;
pub mod logs;
pub mod model;
pub mod topics;
pub mod transport;
pub mod utils;
