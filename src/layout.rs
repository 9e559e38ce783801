//! On-disk layout of a synchronized directory
//!
//! The marker directory and its subtrees are created by an outside
//! bootstrapper. This module only resolves paths inside them:
//!
//! ```text
//! <root>/.meshsync/
//!     org/peers/<id>.json     persisted peer records
//!     local/model.json        local model (never shared)
//!     local/pending.json      open conflicts and fetch origins
//!     local/self.json         self identity bundle
//!     local/auth.json         challenge secret
//!     temp/                   outgoing staging
//!     receiving/<id>          incoming staging, keyed by identifier
//!     removed/                removal tracking
//! ```

use std::path::{Path, PathBuf};

pub const DOT_DIR: &str = ".meshsync";
pub const ORG_DIR: &str = "org";
pub const PEERS_DIR: &str = "peers";
pub const LOCAL_DIR: &str = "local";
pub const TEMP_DIR: &str = "temp";
pub const RECEIVING_DIR: &str = "receiving";
pub const REMOVE_DIR: &str = "removed";
pub const ENDING: &str = ".json";
pub const MODEL_JSON: &str = "model.json";
pub const PENDING_JSON: &str = "pending.json";
pub const SELF_PEER_JSON: &str = "self.json";
pub const AUTH_JSON: &str = "auth.json";
pub const DIRECTORY_LIST: &str = "directory.list";

/// Path resolver rooted at one synchronized directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
	root: PathBuf,
}

impl Layout {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Layout { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn dot_dir(&self) -> PathBuf {
		self.root.join(DOT_DIR)
	}

	pub fn org_dir(&self) -> PathBuf {
		self.dot_dir().join(ORG_DIR)
	}

	pub fn peers_dir(&self) -> PathBuf {
		self.org_dir().join(PEERS_DIR)
	}

	pub fn local_dir(&self) -> PathBuf {
		self.dot_dir().join(LOCAL_DIR)
	}

	pub fn temp_dir(&self) -> PathBuf {
		self.dot_dir().join(TEMP_DIR)
	}

	pub fn receiving_dir(&self) -> PathBuf {
		self.dot_dir().join(RECEIVING_DIR)
	}

	pub fn removed_dir(&self) -> PathBuf {
		self.dot_dir().join(REMOVE_DIR)
	}

	pub fn peer_file(&self, identification: &str) -> PathBuf {
		self.peers_dir().join(format!("{}{}", identification, ENDING))
	}

	pub fn model_file(&self) -> PathBuf {
		self.local_dir().join(MODEL_JSON)
	}

	pub fn pending_file(&self) -> PathBuf {
		self.local_dir().join(PENDING_JSON)
	}

	pub fn self_file(&self) -> PathBuf {
		self.local_dir().join(SELF_PEER_JSON)
	}

	pub fn auth_file(&self) -> PathBuf {
		self.local_dir().join(AUTH_JSON)
	}

	/// Staging file for an incoming transfer
	pub fn staging_path(&self, identification: &str) -> PathBuf {
		self.receiving_dir().join(identification)
	}

	/// Where a tracked object lives on disk
	pub fn object_path(&self, subpath: &str) -> PathBuf {
		if subpath.is_empty() {
			return self.root.clone();
		}
		self.root.join(subpath)
	}

	/// Whether the directory carries the marker directory
	pub fn is_sync_root(&self) -> bool {
		self.dot_dir().is_dir()
	}
}

/// Shorthand for `Layout::new(path).is_sync_root()`
pub fn is_sync_root(path: &Path) -> bool {
	Layout::new(path).is_sync_root()
}


// vim: ts=4
