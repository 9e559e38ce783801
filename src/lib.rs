//! # meshsync - Peer-to-peer directory synchronization core
//!
//! Every replica of a synchronized directory tracks its files and directories
//! as [`ObjectInfo`] records carrying a [`VersionVector`]. Replicas exchange
//! six kinds of protocol messages; incoming updates are validated against the
//! local version, applied when they are causally newer and turned into
//! conflict pairs when both sides changed independently.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use meshsync::{Config, Coordinator, Layout};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let coordinator = Arc::new(Coordinator::open(Layout::new("./share"), config).await?);
//!     let outbound = coordinator.local_modify("notes.txt").await?;
//!     meshsync::session::dispatch(transport.as_ref(), outbound).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod layout;
pub mod lock;
pub mod logging;
pub mod model;
pub mod object;
pub mod path;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod strategies;
pub mod util;
pub mod version;

// Re-export commonly used types
pub use config::Config;
pub use conflict::{Conflict, ConflictType, Resolution};
pub use coordinator::{Coordinator, Outbound};
pub use error::SyncError;
pub use layout::Layout;
pub use model::{Model, ObjectState};
pub use object::ObjectInfo;
pub use peer::{Peer, PeerRegistry};
pub use protocol::{Message, Transport};
pub use strategies::ValidationPolicy;
pub use version::VersionVector;

// vim: ts=4
