//! Core data models for contend.
//!
//! - Configuration resolved once per session
//! - Error taxonomy separating slot-local from session-fatal failures
//! - Symbols, measurements and the records emitted per slot

mod config;
mod error;
mod report;
mod symbol;

pub use config::*;
pub use error::*;
pub use report::*;
pub use symbol::*;
