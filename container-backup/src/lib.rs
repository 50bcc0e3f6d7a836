//! Container Backup Library
//!
//! Captures a container, or every container of a compose project, into a
//! portable gzip tar archive and recreates it on another host.

pub mod archive;
pub mod compose;
pub mod config;
pub mod engine;
pub mod fs;
pub mod runtime;
pub mod shutdown;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use engine::Engine;
pub use runtime::{Capability, RuntimeAdapter};
pub use utils::errors::{EngineError, Result};
