//! Registry of known synchronized roots
//!
//! A plain list of absolute paths, one per line, kept in `directory.list`
//! inside the configuration directory. The registry is an ordinary value: it
//! is loaded, handed to whoever needs it, and saved explicitly.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::SyncError;
use crate::layout::{self, DIRECTORY_LIST};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryRegistry {
	file: PathBuf,
	roots: Vec<PathBuf>,
}

impl DirectoryRegistry {
	/// Empty registry persisted below `config_dir`
	pub fn new(config_dir: &Path) -> Self {
		DirectoryRegistry { file: config_dir.join(DIRECTORY_LIST), roots: Vec::new() }
	}

	/// Load the registry; a missing list file yields an empty registry
	pub async fn load(config_dir: &Path) -> Result<Self, SyncError> {
		let mut registry = Self::new(config_dir);
		let data = match tokio::fs::read_to_string(&registry.file).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				debug!("No directory list at {}", registry.file.display());
				return Ok(registry);
			}
			Err(e) => return Err(e.into()),
		};
		for line in data.lines().map(str::trim).filter(|l| !l.is_empty()) {
			registry.add(line);
		}
		Ok(registry)
	}

	pub async fn save(&self) -> Result<(), SyncError> {
		if let Some(parent) = self.file.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let mut data = String::new();
		for root in &self.roots {
			data.push_str(&root.to_string_lossy());
			data.push('\n');
		}
		tokio::fs::write(&self.file, data).await?;
		Ok(())
	}

	pub fn file(&self) -> &Path {
		&self.file
	}

	pub fn roots(&self) -> &[PathBuf] {
		&self.roots
	}

	pub fn contains(&self, root: impl AsRef<Path>) -> bool {
		self.roots.iter().any(|r| r == root.as_ref())
	}

	/// Add a root; returns false if it was already known
	pub fn add(&mut self, root: impl Into<PathBuf>) -> bool {
		let root = root.into();
		if self.contains(&root) {
			return false;
		}
		self.roots.push(root);
		true
	}

	pub fn remove(&mut self, root: impl AsRef<Path>) -> bool {
		let before = self.roots.len();
		self.roots.retain(|r| r != root.as_ref());
		before != self.roots.len()
	}

	/// Drop every root that no longer carries a marker directory
	pub fn prune(&mut self) -> Vec<PathBuf> {
		let (keep, gone): (Vec<_>, Vec<_>) =
			self.roots.drain(..).partition(|root| layout::is_sync_root(root));
		self.roots = keep;
		for root in &gone {
			info!("Forgetting {}: not a synchronized root anymore", root.display());
		}
		gone
	}
}


// vim: ts=4
