//! Peer identity records and the registry of known peers
//!
//! Every peer is persisted as one JSON file below `org/peers`. The
//! `authenticated` flag is session state: it is never written to disk and
//! starts out false whenever a record is loaded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::layout::{Layout, ENDING};
use crate::protocol::Communication;
use crate::util;

/// A participant of the synchronized directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
	pub name: String,
	pub address: String,
	pub protocol: Communication,

	/// Trusted peers are data sources and must answer a challenge every
	/// session before their messages are acted upon.
	#[serde(default)]
	pub trusted: bool,

	pub identification: String,

	#[serde(skip)]
	pub authenticated: bool,
}

impl Peer {
	pub fn new(name: &str, address: &str, trusted: bool) -> Self {
		Peer {
			name: name.to_string(),
			address: address.to_string(),
			protocol: Communication::Tox,
			trusted,
			identification: util::new_identifier(),
			authenticated: false,
		}
	}

	/// Whether messages from this peer may currently be acted upon
	pub fn is_admitted(&self) -> bool {
		!self.trusted || self.authenticated
	}

	/// Write this record to its file in the peers directory
	pub async fn store(&self, layout: &Layout) -> Result<(), SyncError> {
		let data = serde_json::to_string_pretty(self)?;
		tokio::fs::write(layout.peer_file(&self.identification), data).await?;
		Ok(())
	}
}

/// All peers known to the local replica
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
	peers: BTreeMap<String, Peer>,
}

impl PeerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Load every peer record; unreadable records are skipped with a warning
	pub async fn load(layout: &Layout) -> Result<Self, SyncError> {
		let mut registry = PeerRegistry::new();
		let mut entries = tokio::fs::read_dir(layout.peers_dir()).await?;
		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			if !path.to_string_lossy().ends_with(ENDING) {
				continue;
			}
			let data = match tokio::fs::read_to_string(&path).await {
				Ok(data) => data,
				Err(e) => {
					warn!("Error loading peer {} from disk: {}", path.display(), e);
					continue;
				}
			};
			match json5::from_str::<Peer>(&data) {
				Ok(peer) => {
					debug!("Loaded peer {} ({})", peer.name, peer.identification);
					registry.insert(peer);
				}
				Err(e) => warn!("Error unmarshaling peer {} from disk: {}", path.display(), e),
			}
		}
		Ok(registry)
	}

	/// Persist every record
	pub async fn store(&self, layout: &Layout) -> Result<(), SyncError> {
		for peer in self.peers.values() {
			peer.store(layout).await?;
		}
		Ok(())
	}

	pub fn insert(&mut self, peer: Peer) -> Option<Peer> {
		self.peers.insert(peer.identification.clone(), peer)
	}

	pub fn remove(&mut self, identification: &str) -> Option<Peer> {
		self.peers.remove(identification)
	}

	pub fn get(&self, identification: &str) -> Option<&Peer> {
		self.peers.get(identification)
	}

	pub fn get_mut(&mut self, identification: &str) -> Option<&mut Peer> {
		self.peers.get_mut(identification)
	}

	pub fn contains(&self, identification: &str) -> bool {
		self.peers.contains_key(identification)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Peer> {
		self.peers.values()
	}

	pub fn len(&self) -> usize {
		self.peers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.peers.is_empty()
	}

	/// Identifiers of every peer except `except`
	pub fn others(&self, except: &str) -> Vec<String> {
		self.peers.keys().filter(|id| id.as_str() != except).cloned().collect()
	}

	pub fn set_authenticated(&mut self, identification: &str, value: bool) -> Result<(), SyncError> {
		let peer = self
			.peers
			.get_mut(identification)
			.ok_or_else(|| SyncError::UnknownPeer { peer: identification.to_string() })?;
		peer.authenticated = value;
		Ok(())
	}

	/// Forget authentication of one peer, as at the start of a new session
	pub fn reset_session(&mut self, identification: &str) {
		if let Some(peer) = self.peers.get_mut(identification) {
			peer.authenticated = false;
		}
	}
}

/// Local peer record plus the opaque identity blob of the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityBundle {
	pub self_peer: Peer,
	#[serde(with = "base64_bytes")]
	pub transport_data: Vec<u8>,
}

impl IdentityBundle {
	pub async fn load(layout: &Layout) -> Result<Self, SyncError> {
		let data = tokio::fs::read_to_string(layout.self_file()).await?;
		Ok(json5::from_str(&data)?)
	}

	pub async fn store(&self, layout: &Layout) -> Result<(), SyncError> {
		let data = serde_json::to_string_pretty(self)?;
		tokio::fs::write(layout.self_file(), data).await?;
		Ok(())
	}
}

mod base64_bytes {
	use base64::{engine::general_purpose::STANDARD, Engine as _};
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let text = String::deserialize(deserializer)?;
		STANDARD.decode(text).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn layout() -> (tempfile::TempDir, Layout) {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		std::fs::create_dir_all(layout.peers_dir()).unwrap();
		std::fs::create_dir_all(layout.local_dir()).unwrap();
		(dir, layout)
	}

	#[test]
	fn test_authenticated_not_serialized() {
		let mut peer = Peer::new("alice", "addr", true);
		peer.authenticated = true;
		let json = serde_json::to_string(&peer).unwrap();
		assert!(!json.contains("authenticated"));
		assert!(json.contains("\"protocol\":\"tox\""));
		let back: Peer = serde_json::from_str(&json).unwrap();
		assert!(!back.authenticated);
		assert_eq!(back.identification, peer.identification);
	}

	#[test]
	fn test_admission() {
		let mut trusted = Peer::new("t", "a", true);
		assert!(!trusted.is_admitted());
		trusted.authenticated = true;
		assert!(trusted.is_admitted());
		assert!(Peer::new("u", "a", false).is_admitted());
	}

	#[tokio::test]
	async fn test_store_and_load_skips_garbage() {
		let (_dir, layout) = layout();
		let alice = Peer::new("alice", "addr-a", true);
		let bob = Peer::new("bob", "addr-b", false);
		alice.store(&layout).await.unwrap();
		bob.store(&layout).await.unwrap();
		std::fs::write(layout.peers_dir().join("broken.json"), "{ nope").unwrap();
		std::fs::write(layout.peers_dir().join("README"), "ignored").unwrap();

		let registry = PeerRegistry::load(&layout).await.unwrap();
		assert_eq!(registry.len(), 2);
		assert_eq!(registry.get(&alice.identification).unwrap().name, "alice");
		assert!(registry.get(&alice.identification).unwrap().trusted);
		assert!(!registry.get(&bob.identification).unwrap().authenticated);
	}

	#[tokio::test]
	async fn test_load_missing_directory_fails() {
		let dir = tempfile::tempdir().unwrap();
		assert!(PeerRegistry::load(&Layout::new(dir.path())).await.is_err());
	}

	#[test]
	fn test_session_reset() {
		let mut registry = PeerRegistry::new();
		let peer = Peer::new("p", "a", true);
		let id = peer.identification.clone();
		registry.insert(peer);
		registry.set_authenticated(&id, true).unwrap();
		assert!(registry.get(&id).unwrap().authenticated);
		registry.reset_session(&id);
		assert!(!registry.get(&id).unwrap().authenticated);
		assert!(registry.set_authenticated("ghost", true).is_err());
	}

	#[tokio::test]
	async fn test_identity_bundle_round_trip() {
		let (_dir, layout) = layout();
		let bundle = IdentityBundle {
			self_peer: Peer::new("me", "my-addr", false),
			transport_data: vec![0, 159, 146, 150, 255],
		};
		bundle.store(&layout).await.unwrap();
		let loaded = IdentityBundle::load(&layout).await.unwrap();
		assert_eq!(loaded, bundle);
	}
}

// vim: ts=4
