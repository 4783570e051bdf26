//! Backup Orchestrator Library
//!
//! Runs at most one supervised backup or restore job at a time, drives an
//! external transfer engine per component, and exposes control over HTTP.

pub mod api;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod job;
pub mod orchestrator;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use orchestrator::Orchestrator;
pub use utils::errors::{OrchestratorError, Result};
