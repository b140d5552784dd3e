//! # dasgate core
//!
//! Configuration and error types shared by the gateway binary and the
//! task engine.

pub mod config;
pub mod error;

pub use config::{GatewayConfig, TasksConfig};
pub use error::{GatewayError, Result};
