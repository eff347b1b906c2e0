//! Shared configuration and observability for dbscript

pub mod config;
pub mod observability;

pub use config::*;
pub use observability::*;
