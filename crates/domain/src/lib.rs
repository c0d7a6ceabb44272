//! `pg-domain` — configuration and shared error types for the Polyglot supervisor.

pub mod config;
pub mod error;

pub use error::{Error, Result};
