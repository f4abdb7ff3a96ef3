//! gwtls operator: command-line configuration and controller wiring

#![deny(missing_docs)]

/// Command-line and environment configuration
pub mod config;
/// Builds the TLSPolicy controller future
pub mod controller_runner;
