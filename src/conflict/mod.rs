//! Conflict detection records and naming
//!
//! When an incoming update is rejected both sides are kept. The local copy is
//! moved aside under the local suffix, the incoming one is fetched under the
//! remote suffix, and a [`Conflict`] stays on record until it is resolved.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::object::ObjectInfo;

pub mod resolver;

pub use crate::strategies::Resolution;
pub use resolver::{ConflictResolver, Resolved};

pub const DEFAULT_LOCAL_SUFFIX: &str = ".LOCAL";
pub const DEFAULT_REMOTE_SUFFIX: &str = ".REMOTE";

/// Types of conflicts that can occur
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
	/// Object modified independently on two replicas
	ModifyModify,

	/// Object removed on one replica, modified on another
	RemoveModify,
}

impl fmt::Display for ConflictType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConflictType::ModifyModify => write!(f, "modify/modify"),
			ConflictType::RemoveModify => write!(f, "remove/modify"),
		}
	}
}

/// An outstanding conflict on one identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
	pub identification: String,
	pub conflict_type: ConflictType,

	/// Peer whose update was rejected
	pub peer: String,

	/// Local object as it was when the conflict was detected
	pub local: ObjectInfo,

	/// The rejected incoming object
	pub remote: ObjectInfo,

	/// Where the local copy was moved to
	pub local_path: String,

	/// Where the incoming copy is materialized
	pub remote_path: String,

	/// Incoming content has arrived
	#[serde(default)]
	pub materialized: bool,
}

impl Conflict {
	/// Whether `version` supersedes both sides of this conflict
	pub fn is_settled_by(&self, remote: &ObjectInfo) -> bool {
		remote.version.includes(&self.local.version) && remote.version.includes(&self.remote.version)
	}

	/// Whether the incoming content still has to be fetched
	pub fn needs_content(&self) -> bool {
		self.conflict_type == ConflictType::ModifyModify
			&& !self.remote.directory
			&& !self.materialized
	}
}

impl fmt::Display for Conflict {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} conflict on {} with {} (local {}, remote {})",
			self.conflict_type, self.local.path, self.peer, self.local.version, self.remote.version
		)
	}
}

/// Insert `suffix` before the extension of the last path element.
///
/// `docs/report.txt` becomes `docs/report.LOCAL.txt`; names without an
/// extension, and dot files, get the suffix appended.
pub fn conflict_name(path: &str, suffix: &str) -> String {
	let (dir, name) = match path.rfind('/') {
		Some(idx) => (&path[..=idx], &path[idx + 1..]),
		None => ("", path),
	};
	match name.rfind('.') {
		Some(dot) if dot > 0 => format!("{}{}{}{}", dir, &name[..dot], suffix, &name[dot..]),
		_ => format!("{}{}{}", dir, name, suffix),
	}
}

/// Outstanding conflicts keyed by identifier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictSet {
	conflicts: BTreeMap<String, Conflict>,
}

impl ConflictSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, conflict: Conflict) {
		self.conflicts.insert(conflict.identification.clone(), conflict);
	}

	pub fn get(&self, identification: &str) -> Option<&Conflict> {
		self.conflicts.get(identification)
	}

	pub fn get_mut(&mut self, identification: &str) -> Option<&mut Conflict> {
		self.conflicts.get_mut(identification)
	}

	pub fn remove(&mut self, identification: &str) -> Option<Conflict> {
		self.conflicts.remove(identification)
	}

	pub fn contains(&self, identification: &str) -> bool {
		self.conflicts.contains_key(identification)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
		self.conflicts.values()
	}

	pub fn len(&self) -> usize {
		self.conflicts.len()
	}

	pub fn is_empty(&self) -> bool {
		self.conflicts.is_empty()
	}
}


// vim: ts=4
