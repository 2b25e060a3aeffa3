pub mod dispatcher;
pub mod matcher;
pub mod source;
