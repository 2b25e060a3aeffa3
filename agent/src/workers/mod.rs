pub mod listener;
pub mod reporter;
