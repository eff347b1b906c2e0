//! MySQL binlog listener for dbscript

pub mod binlog;
pub mod config;
pub mod connection;
pub mod listener;
pub mod source;

pub use binlog::*;
pub use config::*;
pub use connection::*;
pub use listener::*;
pub use source::*;
