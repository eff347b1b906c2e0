//! Core types, event translation and streaming pipeline for dbscript

pub mod error;
pub mod event;
pub mod processor;
pub mod stream;
pub mod translator;

pub use error::*;
pub use event::*;
pub use processor::*;
pub use stream::*;
pub use translator::*;

pub use tokio_util::sync::CancellationToken;
