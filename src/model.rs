//! Local replica model
//!
//! The tracked tree of one replica together with the per-object state machine
//! and the set of retired identifiers. Absent from `states` means unknown,
//! present in `tombstones` means removed for good.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

use crate::error::SyncError;
use crate::layout::Layout;
use crate::object::ObjectInfo;
use crate::path::is_safe_subpath;

/// Where an object stands in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ObjectState {
	/// In sync with what we last announced or accepted
	Tracked,

	/// Changed locally since the last announcement
	Modified,

	/// A peer removed it; waiting for the local removal to be confirmed
	RemovalPending { by: String },

	/// A conflict pair is outstanding
	Conflicted,
}

impl fmt::Display for ObjectState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ObjectState::Tracked => write!(f, "tracked"),
			ObjectState::Modified => write!(f, "modified"),
			ObjectState::RemovalPending { by } => write!(f, "removal pending ({})", by),
			ObjectState::Conflicted => write!(f, "conflicted"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
	pub root: ObjectInfo,

	#[serde(default)]
	states: BTreeMap<String, ObjectState>,

	#[serde(default)]
	tombstones: BTreeSet<String>,
}

impl Default for Model {
	fn default() -> Self {
		Model::new(ObjectInfo::new_directory("", ""))
	}
}

impl Model {
	/// Model around an existing tree; every object in it starts out tracked
	pub fn new(root: ObjectInfo) -> Self {
		let mut states = BTreeMap::new();
		root.walk(&mut |object| {
			states.insert(object.identification.clone(), ObjectState::Tracked);
		});
		Model { root, states, tombstones: BTreeSet::new() }
	}

	/// Build a fresh model by scanning the synchronized root
	pub async fn scan(layout: &Layout) -> Result<Self, SyncError> {
		let root = ObjectInfo::from_path(layout.root(), "").await?;
		root.check()?;
		Ok(Model::new(root))
	}

	/// Load the persisted model, `None` if there is none yet
	pub async fn load(layout: &Layout) -> Result<Option<Self>, SyncError> {
		let path = layout.model_file();
		let data = match tokio::fs::read_to_string(&path).await {
			Ok(data) => data,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let model: Model = json5::from_str(&data).map_err(|e| SyncError::Serialization {
			message: format!("{}: {}", path.display(), e),
		})?;
		model.root.check()?;
		debug!("Loaded model with {} objects", model.states.len());
		Ok(Some(model))
	}

	pub async fn store(&self, layout: &Layout) -> Result<(), SyncError> {
		let data = serde_json::to_string_pretty(self)?;
		tokio::fs::write(layout.model_file(), data).await?;
		Ok(())
	}

	pub fn get(&self, identification: &str) -> Option<&ObjectInfo> {
		self.root.find(identification)
	}

	pub fn get_mut(&mut self, identification: &str) -> Option<&mut ObjectInfo> {
		self.root.find_mut(identification)
	}

	pub fn find_by_path(&self, path: &str) -> Option<&ObjectInfo> {
		self.root.find_by_path(path)
	}

	pub fn state(&self, identification: &str) -> Option<&ObjectState> {
		self.states.get(identification)
	}

	pub fn set_state(&mut self, identification: &str, state: ObjectState) -> Result<(), SyncError> {
		match self.states.get_mut(identification) {
			Some(current) => {
				*current = state;
				Ok(())
			}
			None => Err(SyncError::not_tracked(identification)),
		}
	}

	pub fn is_tracked(&self, identification: &str) -> bool {
		self.states.contains_key(identification)
	}

	pub fn is_retired(&self, identification: &str) -> bool {
		self.tombstones.contains(identification)
	}

	/// Add an object (with its subtree) to the tree
	pub fn track(&mut self, object: ObjectInfo, state: ObjectState) -> Result<(), SyncError> {
		if self.is_retired(&object.identification) {
			return Err(SyncError::illegal(format!(
				"identifier {} has been retired",
				object.identification
			)));
		}
		if self.is_tracked(&object.identification) {
			return Err(SyncError::illegal(format!(
				"identifier {} is already tracked",
				object.identification
			)));
		}
		let mut ids = Vec::new();
		let mut unsafe_path = None;
		object.walk(&mut |o| {
			ids.push(o.identification.clone());
			if unsafe_path.is_none() && !is_safe_subpath(&o.path) {
				unsafe_path = Some(o.path.clone());
			}
		});
		if let Some(path) = unsafe_path {
			return Err(SyncError::illegal(format!("refusing to track {:?}", path)));
		}
		self.root.insert(object)?;
		for id in ids {
			self.states.insert(id, state.clone());
		}
		Ok(())
	}

	/// Take an object out of the tree without retiring it
	pub fn untrack(&mut self, identification: &str) -> Option<ObjectInfo> {
		let object = self.root.detach(identification)?;
		object.walk(&mut |o| {
			self.states.remove(&o.identification);
		});
		Some(object)
	}

	/// Remove an object and its subtree for good; the identifiers are never
	/// accepted again.
	pub fn retire(&mut self, identification: &str) -> Option<ObjectInfo> {
		let object = self.untrack(identification)?;
		object.walk(&mut |o| {
			self.tombstones.insert(o.identification.clone());
		});
		Some(object)
	}

	/// Move an object to a new path, re-inserting it under its new parent
	pub fn relocate(&mut self, identification: &str, new_path: &str) -> Result<(), SyncError> {
		if !is_safe_subpath(new_path) {
			return Err(SyncError::illegal(format!("refusing to move {} to {:?}", identification, new_path)));
		}
		if self.root.find_by_path(new_path).is_some() {
			return Err(SyncError::illegal(format!("path {} is already taken", new_path)));
		}
		let mut object =
			self.root.detach(identification).ok_or_else(|| SyncError::not_tracked(identification))?;
		let old_path = object.path.clone();
		object.relocate(new_path);
		if let Err(e) = self.root.insert(object.clone()) {
			// put it back where it was
			object.relocate(&old_path);
			self.root.insert(object)?;
			return Err(e);
		}
		Ok(())
	}

	/// All objects sorted by path
	pub fn objects(&self) -> Vec<&ObjectInfo> {
		self.root.flatten()
	}

	/// Identifiers of objects whose content has not been fetched yet
	pub fn shadows(&self) -> Vec<String> {
		let mut ids = Vec::new();
		self.root.walk(&mut |o| {
			if o.shadow {
				ids.push(o.identification.clone());
			}
		});
		ids
	}

	/// Objects waiting for their local removal, with the peer that removed them
	pub fn pending_removals(&self) -> Vec<(String, String)> {
		self.states
			.iter()
			.filter_map(|(id, state)| match state {
				ObjectState::RemovalPending { by } => Some((id.clone(), by.clone())),
				_ => None,
			})
			.collect()
	}

	/// Identifiers with an outstanding conflict
	pub fn conflicted(&self) -> Vec<String> {
		self.states
			.iter()
			.filter(|(_, state)| **state == ObjectState::Conflicted)
			.map(|(id, _)| id.clone())
			.collect()
	}

	pub fn tombstones(&self) -> impl Iterator<Item = &str> {
		self.tombstones.iter().map(String::as_str)
	}

	pub fn check(&self) -> Result<(), SyncError> {
		self.root.check()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn model() -> Model {
		let mut root = ObjectInfo::new_directory("", "");
		root.insert(ObjectInfo::new_directory("docs", "docs")).unwrap();
		root.insert(ObjectInfo::new_file("a.txt", "docs/a.txt", "h1")).unwrap();
		Model::new(root)
	}

	#[test]
	fn test_new_tracks_everything() {
		let model = model();
		let a = model.find_by_path("docs/a.txt").unwrap();
		assert_eq!(model.state(&a.identification), Some(&ObjectState::Tracked));
		assert_eq!(model.objects().len(), 3);
	}

	#[test]
	fn test_retire_is_permanent() {
		let mut model = model();
		let docs = model.find_by_path("docs").unwrap().identification.clone();
		let a = model.find_by_path("docs/a.txt").unwrap().clone();
		let removed = model.retire(&docs).unwrap();
		assert_eq!(removed.objects.len(), 1);
		assert!(model.is_retired(&a.identification));
		assert!(!model.is_tracked(&a.identification));
		assert!(model.track(a, ObjectState::Tracked).is_err());
	}

	#[test]
	fn test_track_rejects_duplicates() {
		let mut model = model();
		let a = model.find_by_path("docs/a.txt").unwrap().clone();
		assert!(model.track(a, ObjectState::Tracked).is_err());
	}

	#[test]
	fn test_relocate_moves_between_directories() {
		let mut model = model();
		let a = model.find_by_path("docs/a.txt").unwrap().identification.clone();
		model.relocate(&a, "b.txt").unwrap();
		assert_eq!(model.get(&a).unwrap().path, "b.txt");
		assert!(model.root.objects.iter().any(|o| o.identification == a));
		model.check().unwrap();
	}

	#[test]
	fn test_relocate_to_taken_path_fails() {
		let mut model = model();
		let a = model.find_by_path("docs/a.txt").unwrap().identification.clone();
		assert!(model.relocate(&a, "docs").is_err());
		assert_eq!(model.get(&a).unwrap().path, "docs/a.txt");
	}

	#[test]
	fn test_unsafe_paths_are_refused() {
		let mut model = model();
		let escape = ObjectInfo::new_directory("x", "../x");
		assert!(matches!(model.track(escape, ObjectState::Tracked), Err(SyncError::IllegalState { .. })));
		let marker = ObjectInfo::new_file("model.json", ".meshsync/local/model.json", "h");
		assert!(model.track(marker, ObjectState::Tracked).is_err());

		let a = model.find_by_path("docs/a.txt").unwrap().identification.clone();
		assert!(model.relocate(&a, "../a.txt").is_err());
		assert!(model.relocate(&a, ".meshsync/local/auth.json").is_err());
		assert_eq!(model.get(&a).unwrap().path, "docs/a.txt");
		model.check().unwrap();
	}

	#[test]
	fn test_set_state_unknown() {
		let mut model = model();
		assert!(matches!(
			model.set_state("nope", ObjectState::Modified),
			Err(SyncError::NotTracked { .. })
		));
	}

	#[tokio::test]
	async fn test_store_and_load() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		std::fs::create_dir_all(layout.local_dir()).unwrap();
		assert!(Model::load(&layout).await.unwrap().is_none());

		let mut model = model();
		let a = model.find_by_path("docs/a.txt").unwrap().identification.clone();
		model.set_state(&a, ObjectState::RemovalPending { by: "peer1".into() }).unwrap();
		model.store(&layout).await.unwrap();

		let loaded = Model::load(&layout).await.unwrap().unwrap();
		assert_eq!(loaded.state(&a), Some(&ObjectState::RemovalPending { by: "peer1".into() }));
		assert_eq!(loaded.objects().len(), 3);
	}

	#[tokio::test]
	async fn test_scan_skips_marker_directory() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		std::fs::create_dir_all(layout.local_dir()).unwrap();
		std::fs::write(dir.path().join("x.txt"), b"x").unwrap();

		let model = Model::scan(&layout).await.unwrap();
		let paths: Vec<&str> = model.objects().iter().map(|o| o.path.as_str()).collect();
		assert_eq!(paths, vec!["", "x.txt"]);
	}
}

// vim: ts=4
