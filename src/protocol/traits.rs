//! Transport seam
//!
//! The P2P network layer is an outside collaborator. The core only needs to
//! hand it messages and files addressed to a peer, and to receive
//! [`Inbound`] events in per-peer order.

use async_trait::async_trait;
use std::path::Path;

use super::error::ProtocolError;
use super::messages::Message;

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Events a transport delivers to the local replica
#[derive(Debug, Clone)]
pub enum Inbound {
	/// A decoded protocol message
	Message { from: String, message: Message },

	/// A file announced by a push has been written to its staging path
	TransferComplete { from: String, identification: String },
}

impl Inbound {
	/// Peer the event came from
	pub fn sender(&self) -> &str {
		match self {
			Inbound::Message { from, .. } | Inbound::TransferComplete { from, .. } => from,
		}
	}
}

/// Outgoing side of the network layer
#[async_trait]
pub trait Transport: Send + Sync {
	/// Send one message to a peer
	async fn send(&self, to: &str, message: &Message) -> ProtocolResult<()>;

	/// Send file contents; the receiver stages them under `identification`
	async fn send_file(&self, to: &str, identification: &str, path: &Path) -> ProtocolResult<()>;
}

// vim: ts=4
