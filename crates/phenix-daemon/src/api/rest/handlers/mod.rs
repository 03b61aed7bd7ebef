//! API request handlers

mod cluster;
mod experiments;
mod health;
mod users;
mod vms;

pub use cluster::*;
pub use experiments::*;
pub use health::*;
pub use users::*;
pub use vms::*;
