//! Common utilities and types

pub mod error;
pub mod logs;

pub use error::{Error, Result};
pub use logs::{LogEvent, LogSink};
