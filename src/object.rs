//! Tracked objects: the versioned file and directory tree
//!
//! An [`ObjectInfo`] is identified by its `identification` alone. Its path
//! may change on rename while identity persists. Directories exclusively own
//! their children; there are no parent back-references, so every lookup walks
//! the tree top-down.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;

use crate::error::SyncError;
use crate::layout::DOT_DIR;
use crate::path::{is_beneath, RelativePath};
use crate::util;
use crate::version::VersionVector;

/// A file or directory under synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
	/// Stable identifier, assigned once
	pub identification: String,

	/// Last path element
	pub name: String,

	/// Path relative to the synchronized root, empty for the root itself
	pub path: String,

	#[serde(default)]
	pub directory: bool,

	/// Known to exist but content not yet fetched
	#[serde(default)]
	pub shadow: bool,

	#[serde(default)]
	pub version: VersionVector,

	/// Content fingerprint, empty for directories
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub content: String,

	/// Children, directories only
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub objects: Vec<ObjectInfo>,
}

impl PartialEq for ObjectInfo {
	fn eq(&self, other: &Self) -> bool {
		self.identification == other.identification
	}
}

impl Eq for ObjectInfo {}

/// Order two objects by path, for deterministic listings
pub fn by_path(a: &ObjectInfo, b: &ObjectInfo) -> Ordering {
	a.path.cmp(&b.path)
}

/// Sort a slice of objects by path
pub fn sort_by_path(objects: &mut [ObjectInfo]) {
	objects.sort_by(by_path);
}

impl ObjectInfo {
	pub fn new_file(name: &str, path: &str, content: &str) -> Self {
		ObjectInfo {
			identification: util::new_identifier(),
			name: name.to_string(),
			path: path.to_string(),
			directory: false,
			shadow: false,
			version: VersionVector::new(),
			content: content.to_string(),
			objects: Vec::new(),
		}
	}

	pub fn new_directory(name: &str, path: &str) -> Self {
		ObjectInfo {
			identification: util::new_identifier(),
			name: name.to_string(),
			path: path.to_string(),
			directory: true,
			shadow: false,
			version: VersionVector::new(),
			content: String::new(),
			objects: Vec::new(),
		}
	}

	/// Build the object (and for directories its subtree) from disk.
	///
	/// Files get a streaming content fingerprint, directories an empty one.
	/// The marker directory at the root is never tracked.
	pub async fn from_path(root: &Path, subpath: &str) -> io::Result<ObjectInfo> {
		let relative = RelativePath::from_paths(root, Path::new(subpath));
		build(relative).await
	}

	/// Copy of this object without children, as sent in updates
	pub fn shallow(&self) -> ObjectInfo {
		ObjectInfo { objects: Vec::new(), ..self.clone() }
	}

	/// Visit self then every descendant, pre-order
	pub fn walk<F: FnMut(&ObjectInfo)>(&self, f: &mut F) {
		f(self);
		for child in &self.objects {
			child.walk(f);
		}
	}

	/// All objects of the tree sorted by path
	pub fn flatten(&self) -> Vec<&ObjectInfo> {
		let mut all = Vec::new();
		collect(self, &mut all);
		all.sort_by(|a, b| by_path(a, b));
		all
	}

	pub fn find(&self, identification: &str) -> Option<&ObjectInfo> {
		if self.identification == identification {
			return Some(self);
		}
		self.objects.iter().find_map(|child| child.find(identification))
	}

	pub fn find_mut(&mut self, identification: &str) -> Option<&mut ObjectInfo> {
		if self.identification == identification {
			return Some(self);
		}
		self.objects.iter_mut().find_map(|child| child.find_mut(identification))
	}

	/// Top-down lookup by relative path, descending only into matching prefixes
	pub fn find_by_path(&self, path: &str) -> Option<&ObjectInfo> {
		if self.path == path {
			return Some(self);
		}
		self.objects
			.iter()
			.filter(|child| child.path == path || is_beneath(&child.path, path))
			.find_map(|child| child.find_by_path(path))
	}

	/// Insert `object` under the deepest existing directory that is an ancestor
	/// of its path. Missing intermediate directories are tolerated.
	pub fn insert(&mut self, object: ObjectInfo) -> Result<(), SyncError> {
		if !self.directory {
			return Err(SyncError::illegal(format!(
				"cannot insert {} below file {}",
				object.path, self.path
			)));
		}
		if !is_beneath(&self.path, &object.path) {
			return Err(SyncError::illegal(format!(
				"{} does not lie beneath {}",
				object.path, self.path
			)));
		}
		if self.objects.iter().any(|child| child.path == object.path) {
			return Err(SyncError::illegal(format!("path {} is already taken", object.path)));
		}
		let next = self
			.objects
			.iter()
			.position(|child| child.directory && is_beneath(&child.path, &object.path));
		match next {
			Some(idx) => self.objects[idx].insert(object),
			None => {
				let at = self
					.objects
					.binary_search_by(|child| child.path.cmp(&object.path))
					.unwrap_or_else(|i| i);
				self.objects.insert(at, object);
				Ok(())
			}
		}
	}

	/// Remove the object with this identifier from the tree and return it
	pub fn detach(&mut self, identification: &str) -> Option<ObjectInfo> {
		if let Some(idx) = self.objects.iter().position(|c| c.identification == identification) {
			return Some(self.objects.remove(idx));
		}
		self.objects.iter_mut().find_map(|child| child.detach(identification))
	}

	/// Move to a new path, rewriting descendant paths with it
	pub fn relocate(&mut self, new_path: &str) {
		let old = std::mem::replace(&mut self.path, new_path.to_string());
		self.name = new_path.rsplit('/').next().unwrap_or(new_path).to_string();
		for child in &mut self.objects {
			child.rebase(&old, new_path);
		}
	}

	fn rebase(&mut self, old_prefix: &str, new_prefix: &str) {
		if let Some(rest) = self.path.strip_prefix(old_prefix) {
			self.path = format!("{}{}", new_prefix, rest);
		}
		for child in &mut self.objects {
			child.rebase(old_prefix, new_prefix);
		}
	}

	/// Verify the tree invariants
	pub fn check(&self) -> Result<(), SyncError> {
		if self.directory && !self.content.is_empty() {
			return Err(SyncError::illegal(format!("directory {} has content", self.path)));
		}
		if !self.directory && !self.objects.is_empty() {
			return Err(SyncError::illegal(format!("file {} has children", self.path)));
		}
		for child in &self.objects {
			if !is_beneath(&self.path, &child.path) {
				return Err(SyncError::illegal(format!(
					"child {} is not beneath {}",
					child.path, self.path
				)));
			}
			child.check()?;
		}
		Ok(())
	}
}

fn collect<'a>(object: &'a ObjectInfo, all: &mut Vec<&'a ObjectInfo>) {
	all.push(object);
	for child in &object.objects {
		collect(child, all);
	}
}

fn build(path: RelativePath) -> Pin<Box<dyn Future<Output = io::Result<ObjectInfo>> + Send>> {
	Box::pin(async move {
		let full = path.to_path_buf();
		let meta = tokio::fs::metadata(&full).await?;
		let subpath = path.subpath();
		let name = path.last_element().to_string();

		if !meta.is_dir() {
			let content = util::content_hash(&full).await?;
			return Ok(ObjectInfo::new_file(&name, &subpath, &content));
		}

		let mut object = ObjectInfo::new_directory(&name, &subpath);
		let mut entries = tokio::fs::read_dir(&full).await?;
		while let Some(entry) = entries.next_entry().await? {
			let file_name = entry.file_name().to_string_lossy().to_string();
			if path.is_root() && file_name == DOT_DIR {
				continue;
			}
			object.objects.push(build(path.join(&file_name)).await?);
		}
		sort_by_path(&mut object.objects);
		Ok(object)
	})
}

impl fmt::Display for ObjectInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match serde_json::to_string(&self.shallow()) {
			Ok(json) => write!(f, "{}", json),
			Err(_) => write!(f, "ObjectInfo{{{}}}", self.identification),
		}
	}
}


// vim: ts=4
