//! In-process transport over tokio channels
//!
//! Connects several replicas living in one process. Messages still pass
//! through the wire codec so that both sides only ever see what a real
//! network would deliver.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::error::ProtocolError;
use super::messages::Message;
use super::traits::*;

const INBOX_CAPACITY: usize = 256;

struct Node {
	inbox: mpsc::Sender<Inbound>,
	receiving: PathBuf,
}

/// Shared switchboard of in-process peers
#[derive(Clone, Default)]
pub struct MemoryNetwork {
	nodes: Arc<Mutex<HashMap<String, Node>>>,
}

impl MemoryNetwork {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a peer; files sent to it are written into `receiving`
	pub async fn join(&self, peer: &str, receiving: PathBuf) -> mpsc::Receiver<Inbound> {
		let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
		self.nodes.lock().await.insert(peer.to_string(), Node { inbox: tx, receiving });
		rx
	}

	/// Remove a peer; further sends to it fail
	pub async fn leave(&self, peer: &str) {
		self.nodes.lock().await.remove(peer);
	}

	/// Transport handle sending on behalf of `local`
	pub fn endpoint(&self, local: &str) -> MemoryTransport {
		MemoryTransport { local: local.to_string(), network: self.clone() }
	}

	async fn route(&self, to: &str) -> ProtocolResult<(mpsc::Sender<Inbound>, PathBuf)> {
		let nodes = self.nodes.lock().await;
		let node = nodes.get(to).ok_or_else(|| ProtocolError::Disconnected(to.to_string()))?;
		Ok((node.inbox.clone(), node.receiving.clone()))
	}
}

/// Sending half bound to one local peer
#[derive(Clone)]
pub struct MemoryTransport {
	local: String,
	network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
	async fn send(&self, to: &str, message: &Message) -> ProtocolResult<()> {
		let (inbox, _) = self.network.route(to).await?;
		let message = Message::decode(&message.encode()?)?;
		debug!("[memory] {} -> {}: {}", self.local, to, message);
		inbox
			.send(Inbound::Message { from: self.local.clone(), message })
			.await
			.map_err(|_| ProtocolError::Disconnected(to.to_string()))
	}

	async fn send_file(&self, to: &str, identification: &str, path: &Path) -> ProtocolResult<()> {
		let (inbox, receiving) = self.network.route(to).await?;
		tokio::fs::create_dir_all(&receiving).await?;
		tokio::fs::copy(path, receiving.join(identification)).await?;
		debug!("[memory] {} -> {}: file {}", self.local, to, identification);
		inbox
			.send(Inbound::TransferComplete {
				from: self.local.clone(),
				identification: identification.to_string(),
			})
			.await
			.map_err(|_| ProtocolError::Disconnected(to.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::types::LockAction;

	#[tokio::test]
	async fn test_message_delivery() {
		let dir = tempfile::tempdir().unwrap();
		let network = MemoryNetwork::new();
		let mut inbox = network.join("b", dir.path().to_path_buf()).await;
		let a = network.endpoint("a");

		a.send("b", &Message::lock(LockAction::Request)).await.unwrap();
		match inbox.recv().await.unwrap() {
			Inbound::Message { from, message } => {
				assert_eq!(from, "a");
				assert_eq!(message, Message::lock(LockAction::Request));
			}
			other => panic!("unexpected {:?}", other),
		}
	}

	#[tokio::test]
	async fn test_file_delivery() {
		let src = tempfile::tempdir().unwrap();
		let dst = tempfile::tempdir().unwrap();
		let file = src.path().join("f");
		std::fs::write(&file, b"payload").unwrap();

		let network = MemoryNetwork::new();
		let receiving = dst.path().join("receiving");
		let mut inbox = network.join("b", receiving.clone()).await;
		network.endpoint("a").send_file("b", "id1", &file).await.unwrap();

		assert!(matches!(
			inbox.recv().await.unwrap(),
			Inbound::TransferComplete { ref identification, .. } if identification == "id1"
		));
		assert_eq!(std::fs::read(receiving.join("id1")).unwrap(), b"payload");
	}

	#[tokio::test]
	async fn test_unknown_peer() {
		let network = MemoryNetwork::new();
		let err = network.endpoint("a").send("ghost", &Message::lock(LockAction::Release)).await;
		assert!(matches!(err, Err(ProtocolError::Disconnected(_))));
	}
}

// vim: ts=4
