//! API layer for phenixd

pub mod rest;

pub use rest::{create_router, AppState};
