//! `Conduit` Core Library
//!
//! Shared functionality for `Conduit` components:
//! - Settings resolution and hierarchy
//! - Tracing subscriber initialisation
//! - Common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
