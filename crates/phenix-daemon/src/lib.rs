//! phenix daemon library
//!
//! This module provides the components behind `phenixd`:
//! - REST API over the control plane, under `/api/v1`
//! - WebSocket stream of role-filtered publications
//! - Token authentication middleware
//! - Configuration and server lifecycle management

pub mod api;
pub mod config;
pub mod error;
pub mod server;

pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError};
pub use server::Server;
