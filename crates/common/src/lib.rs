//! Shared types, error taxonomy, and logging helpers used across all
//! relaygate crates.

pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, FromMessage, Result};
