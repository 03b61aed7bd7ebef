//! # phenix Control Plane
//!
//! Guarded lifecycle operations over experiments and VMs, with
//! role-filtered live notifications.
//!
//! ## Overview
//!
//! The [`ControlPlane`] is the single entry point for all operations. Every
//! state-changing lifecycle operation runs the same protocol through the
//! [`LifecycleCoordinator`]:
//!
//! 1. Authorize the caller's [`Role`](phenix_rbac::Role)
//! 2. Take the resource lock in the [`LockTable`] (conflict is an error, never
//!    a queue)
//! 3. Broadcast the pending state
//! 4. Run the [`Fabric`] call, relaying progress
//! 5. Broadcast the outcome
//! 6. Release the lock, on every path
//!
//! ## Key Components
//!
//! - [`LockTable`]: one in-flight mutation per experiment or VM
//! - [`EventBroker`]: fans broadcasts out to subscribers whose role allows them
//! - [`LifecycleCoordinator`]: the guarded-operation state machine
//! - [`Fabric`] / [`ConfigStore`]: seams to the compute layer and persistence
//! - [`InMemoryConfigStore`] / [`SimulatedFabric`]: in-process collaborators
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use phenix_control::{
//!     ControlPlane, ControlPlaneConfig, InMemoryConfigStore, RequestContext, SimulatedFabric,
//! };
//!
//! # async fn example() -> phenix_control::Result<()> {
//! let plane = ControlPlane::new(
//!     Arc::new(InMemoryConfigStore::new()),
//!     Arc::new(SimulatedFabric::new(vec![], vec![])),
//!     ControlPlaneConfig::default(),
//! );
//!
//! let ctx = RequestContext::anonymous_admin();
//! let mut events = plane.subscribe(&ctx);
//!
//! plane.start_experiment(&ctx, "exp1").await?;
//! while let Some(publication) = events.try_recv() {
//!     println!("{} {}", publication.resource.id, publication.resource.action);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod broker;
pub mod context;
pub mod control_plane;
pub mod error;
pub mod fabric;
pub mod lifecycle;
pub mod lock;
pub mod memory;
pub mod scheduler;
pub mod store;

// Re-exports
pub use broker::{EventBroker, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
pub use context::RequestContext;
pub use control_plane::{ControlPlane, ControlPlaneConfig};
pub use error::{ControlError, Result};
pub use fabric::{Fabric, FabricError, FabricResult, Progress};
pub use lifecycle::{LifecycleConfig, LifecycleCoordinator, Operation};
pub use lock::{LockGuard, LockTable};
pub use memory::{InMemoryConfigStore, Seed, SeedUser, SimulatedFabric};
pub use store::{specialise_role, ConfigStore, UserRecord};
