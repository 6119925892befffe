#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use std::sync::Arc;
//!
//! use mfabric::auth::{MemoryPolicyOracle, MemoryThingRepository};
//! use mfabric::broker::MemoryBroker;
//! use mfabric::context::Substrate;
//! use mfabric::routemap::MemoryStore;
//! use mfabric::conf::Settings;
//!
//! #[tokio::main]
//! async fn main() -> mfabric::Result<()> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let substrate = Substrate::new(
//!         Settings::default(),
//!         broker.clone(),
//!         broker,
//!         Arc::new(MemoryPolicyOracle::new()),
//!         Arc::new(MemoryThingRepository::new()),
//!         Arc::new(MemoryStore::new()),
//!     );
//!     substrate.start().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     substrate.stop().await;
//!     Ok(())
//! }
//! ```

/// Core Components
pub mod auth; // Authentication, authorization and the decision cache
pub mod broker; // Broker and stream store seams, in-memory broker
pub mod context; // Substrate composition root
pub mod error; // Error kinds
pub mod message; // Message validation
pub mod pubsub; // Publisher, subscriber and the connection supervisor
pub mod queue; // Recovery queue
pub mod topic; // Subtopics, subjects and patterns
pub mod types; // Common data types

/// Control Plane
pub mod eventlog; // Event streams and consumer groups
pub mod routemap; // External id mapping

/// Protocol Bridges
pub mod bridge; // Bridge contract and manager

pub mod logger; // slog backed process logger

pub use error::{ErrorKind, FabricError, Result};

/// Re-exports
pub use mfabric_codec as codec;
pub use mfabric_conf as conf;
pub use mfabric_utils as utils;
