//! Shared configuration and plumbing for the valet runtime.
//!
//! Everything here is consumed by the memory, agent, and connector crates;
//! nothing in this crate performs I/O beyond reading the config file.

pub mod config;
pub mod error;
pub mod secret;

pub use config::ValetConfig;
pub use error::CoreError;
