//! Agent unit tests

mod common;
mod test_engine;
mod test_executor;
mod test_fsm;
mod test_ring;
