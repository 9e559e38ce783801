//! Conflict resolution logic

use tracing::debug;

use super::{conflict_name, Conflict, ConflictType, DEFAULT_LOCAL_SUFFIX, DEFAULT_REMOTE_SUFFIX};
use crate::error::SyncError;
use crate::object::ObjectInfo;
use crate::strategies::Resolution;
use crate::version::VersionVector;

/// What has to happen on disk and in the model to settle a conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
	pub resolution: Resolution,

	/// Version dominating both sides
	pub version: VersionVector,

	/// Content fingerprint of the surviving side
	pub content: String,

	/// Conflict copy to move back to the object's path
	pub restore: Option<String>,

	/// Conflict copy to delete
	pub discard: Option<String>,
}

/// Names conflict copies and settles conflicts
#[derive(Debug, Clone)]
pub struct ConflictResolver {
	local_suffix: String,
	remote_suffix: String,
}

impl Default for ConflictResolver {
	fn default() -> Self {
		ConflictResolver::new(DEFAULT_LOCAL_SUFFIX, DEFAULT_REMOTE_SUFFIX)
	}
}

impl ConflictResolver {
	pub fn new(local_suffix: &str, remote_suffix: &str) -> Self {
		ConflictResolver {
			local_suffix: local_suffix.to_string(),
			remote_suffix: remote_suffix.to_string(),
		}
	}

	pub fn local_name(&self, path: &str) -> String {
		conflict_name(path, &self.local_suffix)
	}

	pub fn remote_name(&self, path: &str) -> String {
		conflict_name(path, &self.remote_suffix)
	}

	/// Record a conflict between `local` and the rejected `remote`
	pub fn open(
		&self,
		conflict_type: ConflictType,
		peer: &str,
		local: &ObjectInfo,
		remote: &ObjectInfo,
	) -> Conflict {
		let (local_path, remote_path) = match conflict_type {
			ConflictType::ModifyModify if !local.directory => {
				(self.local_name(&local.path), self.remote_name(&local.path))
			}
			_ => (local.path.clone(), String::new()),
		};
		Conflict {
			identification: local.identification.clone(),
			conflict_type,
			peer: peer.to_string(),
			local: local.shallow(),
			remote: remote.shallow(),
			local_path,
			remote_path,
			materialized: false,
		}
	}

	/// Decide the outcome of `resolution`.
	///
	/// The resulting version is the join of both sides with the self entry
	/// increased, so every replica accepts it as newer than either side.
	pub fn resolve(
		&self,
		conflict: &Conflict,
		resolution: Resolution,
		self_id: &str,
	) -> Result<Resolved, SyncError> {
		let mut version = conflict.local.version.clone();
		version.join(&conflict.remote.version);
		version.increase(self_id);
		debug!("Resolving {} as {}: {}", conflict, resolution, version);

		let directory = conflict.local.directory;
		let resolved = match (conflict.conflict_type, resolution) {
			(ConflictType::RemoveModify, Resolution::KeepLocal) => Resolved {
				resolution,
				version,
				content: conflict.local.content.clone(),
				restore: None,
				discard: None,
			},
			(ConflictType::RemoveModify, Resolution::KeepRemote) => Resolved {
				resolution,
				version: conflict.remote.version.clone(),
				content: String::new(),
				restore: None,
				discard: None,
			},
			(ConflictType::ModifyModify, _) if directory => Resolved {
				resolution,
				version,
				content: String::new(),
				restore: None,
				discard: None,
			},
			(ConflictType::ModifyModify, Resolution::KeepLocal) => Resolved {
				resolution,
				version,
				content: conflict.local.content.clone(),
				restore: Some(conflict.local_path.clone()),
				discard: conflict.materialized.then(|| conflict.remote_path.clone()),
			},
			(ConflictType::ModifyModify, Resolution::KeepRemote) => {
				if !conflict.materialized {
					return Err(SyncError::illegal(format!(
						"incoming content of {} has not arrived yet",
						conflict.local.path
					)));
				}
				Resolved {
					resolution,
					version,
					content: conflict.remote.content.clone(),
					restore: Some(conflict.remote_path.clone()),
					discard: Some(conflict.local_path.clone()),
				}
			}
		};
		Ok(resolved)
	}
}


// vim: ts=4
