//! Task execution

pub mod engine;
pub mod executor;
pub mod fsm;
pub mod installer;
pub mod runner;
pub mod terminal;
