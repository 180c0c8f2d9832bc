//! Shared types for the career coach workspace
//!
//! `Secret` keeps API keys out of logs and error bodies; `Error` covers
//! configuration loading failures shared by the service binaries.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
