//! # trainforge-core
//!
//! Shared plumbing for the trainforge workspace: the core error type, atomic
//! file persistence, layered configuration loading, and tracing setup.
//!
//! The orchestration engine itself lives in `trainforge-engine`.

pub mod config;
pub mod error;
pub mod logging;
pub mod persistence;

pub use config::{LoggingConfig, load_layered};
pub use error::{CoreError, Result};
pub use logging::init_tracing;
