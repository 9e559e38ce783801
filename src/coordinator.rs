//! Coordinator: decides what every incoming message does to the local replica
//!
//! All replica state (model, peers, conflicts, locks, pending fetches and
//! challenges) sits behind one coarse [`tokio::sync::Mutex`]. Handlers run to
//! completion while holding it, so two updates for the same identifier are
//! always applied one after the other.
//!
//! Handlers never talk to the network themselves. They return the
//! [`Outbound`] messages and transfers the caller has to deliver.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::conflict::{Conflict, ConflictResolver, ConflictSet, ConflictType, Resolution};
use crate::error::SyncError;
use crate::layout::{Layout, ENDING};
use crate::lock::{LockDecision, LockRelease, LockTable, LockWaiters};
use crate::model::{Model, ObjectState};
use crate::object::ObjectInfo;
use crate::path::{is_safe_subpath, is_valid_identifier};
use crate::peer::{IdentityBundle, Peer, PeerRegistry};
use crate::protocol::{
	ChallengeMessage, ChallengeStage, LockAction, Message, NotifyMessage, NotifyType, ObjectType,
	Operation, PushMessage, RequestMessage, Transport,
};
use crate::util;
use crate::version::{VersionVector, Validation};

/// Something the caller has to deliver to a peer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
	Message { to: String, message: Message },

	/// Announce with a push, then send the file at `path`
	Transfer { to: String, identification: String, object_type: ObjectType, path: PathBuf },
}

impl Outbound {
	fn message(to: &str, message: Message) -> Self {
		Outbound::Message { to: to.to_string(), message }
	}

	pub fn to(&self) -> &str {
		match self {
			Outbound::Message { to, .. } | Outbound::Transfer { to, .. } => to,
		}
	}
}

/// A content request waiting for its transfer
#[derive(Debug, Clone)]
struct Fetch {
	from: String,
	object_type: ObjectType,
	deadline: Instant,
	pushed: bool,
}

#[derive(Debug, Default)]
struct State {
	model: Model,
	peers: PeerRegistry,
	conflicts: ConflictSet,
	locks: LockTable,
	waiters: LockWaiters,
	fetches: HashMap<String, Fetch>,
	/// Last peer that announced an object, asked again on retries
	origins: HashMap<String, String>,
	/// Nonces of challenges we sent
	challenges: HashMap<String, Vec<u8>>,
	/// Peers that failed their challenge this session
	failed: HashSet<String>,
}

/// Replica state kept across restarts next to the model
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Pending {
	conflicts: ConflictSet,
	origins: HashMap<String, String>,
}

pub struct Coordinator {
	self_id: String,
	layout: Layout,
	config: Config,
	resolver: ConflictResolver,
	auth: Authenticator,
	state: Mutex<State>,
}

impl Coordinator {
	pub fn new(
		self_id: &str,
		layout: Layout,
		model: Model,
		peers: PeerRegistry,
		auth: Authenticator,
		config: Config,
	) -> Self {
		let resolver =
			ConflictResolver::new(&config.local_conflict_suffix, &config.remote_conflict_suffix);
		Coordinator {
			self_id: self_id.to_string(),
			layout,
			config,
			resolver,
			auth,
			state: Mutex::new(State { model, peers, ..State::default() }),
		}
	}

	/// Open the replica at `layout`: identity, persisted model (or a fresh
	/// scan), peers and the shared secret.
	pub async fn open(layout: Layout, config: Config) -> Result<Self, SyncError> {
		if !layout.is_sync_root() {
			return Err(SyncError::NotSyncRoot { path: layout.root().display().to_string() });
		}
		let identity = IdentityBundle::load(&layout).await?;
		let model = match Model::load(&layout).await? {
			Some(model) => model,
			None => {
				info!("No model found, scanning {}", layout.root().display());
				Model::scan(&layout).await?
			}
		};
		let peers = PeerRegistry::load(&layout).await?;
		let auth = Authenticator::load_or_generate(&layout).await?;
		info!(
			"Opened {} as {} ({} peers)",
			layout.root().display(),
			identity.self_peer.identification,
			peers.len()
		);
		let coordinator = Coordinator::new(
			&identity.self_peer.identification,
			layout,
			model,
			peers,
			auth,
			config,
		);
		coordinator.restore().await?;
		Ok(coordinator)
	}

	/// Take back the conflicts and fetch origins written by [`save`](Self::save).
	///
	/// An object left conflicted without a record gets its local copy moved
	/// back into place and is marked modified, so it is announced again.
	pub async fn restore(&self) -> Result<(), SyncError> {
		let mut guard = self.state.lock().await;
		let state = &mut *guard;
		let path = self.layout.pending_file();
		match tokio::fs::read_to_string(&path).await {
			Ok(data) => {
				let pending: Pending = json5::from_str(&data)?;
				for conflict in pending.conflicts.iter() {
					if state.model.is_tracked(&conflict.identification) {
						state.conflicts.insert(conflict.clone());
					}
				}
				for (id, origin) in pending.origins {
					if state.model.is_tracked(&id) {
						state.origins.insert(id, origin);
					}
				}
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {}
			Err(e) => return Err(e.into()),
		}

		for id in state.model.conflicted() {
			if state.conflicts.contains(&id) {
				continue;
			}
			let Some(object) = state.model.get(&id).map(ObjectInfo::shallow) else {
				continue;
			};
			warn!("Conflict record of {} is lost, putting the local copy back", object.path);
			let target = self.layout.object_path(&object.path);
			if !object.directory && !object.shadow && !tokio::fs::try_exists(&target).await? {
				move_path(&self.layout.object_path(&self.resolver.local_name(&object.path)), &target)
					.await?;
			}
			state.model.set_state(&id, ObjectState::Modified)?;
		}
		debug!("Restored {} conflicts, {} fetch origins", state.conflicts.len(), state.origins.len());
		Ok(())
	}

	pub fn self_id(&self) -> &str {
		&self.self_id
	}

	pub fn layout(&self) -> &Layout {
		&self.layout
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Persist the model, open conflicts and fetch origins
	pub async fn save(&self) -> Result<(), SyncError> {
		let state = self.state.lock().await;
		state.model.store(&self.layout).await?;
		let pending = Pending { conflicts: state.conflicts.clone(), origins: state.origins.clone() };
		tokio::fs::write(self.layout.pending_file(), serde_json::to_string_pretty(&pending)?).await?;
		Ok(())
	}

	pub async fn snapshot(&self) -> Model {
		self.state.lock().await.model.clone()
	}

	pub async fn object_at(&self, path: &str) -> Option<ObjectInfo> {
		self.state.lock().await.model.find_by_path(path).map(ObjectInfo::shallow)
	}

	pub async fn state_of(&self, identification: &str) -> Option<ObjectState> {
		self.state.lock().await.model.state(identification).cloned()
	}

	pub async fn conflicts(&self) -> Vec<Conflict> {
		self.state.lock().await.conflicts.iter().cloned().collect()
	}

	pub async fn peer(&self, identification: &str) -> Option<Peer> {
		self.state.lock().await.peers.get(identification).cloned()
	}

	pub async fn peer_ids(&self) -> Vec<String> {
		self.state.lock().await.peers.others(&self.self_id)
	}

	pub async fn lock_holder(&self) -> Option<String> {
		self.state.lock().await.locks.holder().map(|g| g.peer.clone())
	}

	pub async fn pending_fetches(&self) -> Vec<String> {
		let mut ids: Vec<String> = self.state.lock().await.fetches.keys().cloned().collect();
		ids.sort();
		ids
	}

	/// Register a peer and persist its record
	pub async fn add_peer(&self, peer: Peer) -> Result<(), SyncError> {
		peer.store(&self.layout).await?;
		self.state.lock().await.peers.insert(peer);
		Ok(())
	}

	// ========================================================================
	// SESSIONS & INCOMING MESSAGES
	// ========================================================================

	/// Start a new session with `peer`: authentication is forgotten and
	/// trusted peers are challenged again.
	pub async fn begin_session(&self, peer: &str) -> Result<Vec<Outbound>, SyncError> {
		let mut state = self.state.lock().await;
		let trusted = state
			.peers
			.get(peer)
			.map(|p| p.trusted)
			.ok_or_else(|| SyncError::UnknownPeer { peer: peer.to_string() })?;
		state.peers.reset_session(peer);
		state.failed.remove(peer);
		state.challenges.remove(peer);
		if !trusted {
			return Ok(Vec::new());
		}
		let nonce = self.auth.nonce();
		state.challenges.insert(peer.to_string(), nonce.clone());
		debug!("Challenging {}", peer);
		Ok(vec![Outbound::message(peer, Message::challenge(ChallengeStage::Challenge, nonce))])
	}

	/// Apply one message received from `from`
	pub async fn handle(&self, from: &str, message: Message) -> Result<Vec<Outbound>, SyncError> {
		let mut state = self.state.lock().await;
		if from == self.self_id {
			warn!("Ignoring message from ourselves: {}", message);
			return Ok(Vec::new());
		}
		debug!("{} <- {}: {}", self.self_id, from, message);
		let message = match message {
			Message::Challenge(challenge) => return self.handle_challenge(&mut state, from, challenge),
			other => other,
		};
		admit(&state, from)?;

		match message {
			Message::Update(update) => {
				self.handle_update(&mut state, from, update.operation, update.object.shallow()).await
			}
			Message::Request(request) => {
				check_identifier(from, &request.identification)?;
				self.handle_request(&mut state, from, request).await
			}
			Message::Notify(notify) => {
				check_identifier(from, &notify.identification)?;
				self.handle_notify(&mut state, from, notify).await
			}
			Message::Lock(lock) => Ok(self.handle_lock(&mut state, from, lock.action)),
			Message::Push(push) => {
				check_identifier(from, &push.identification)?;
				self.handle_push(&mut state, from, push).await
			}
			Message::Challenge(_) => Ok(Vec::new()),
		}
	}

	fn handle_challenge(
		&self,
		state: &mut State,
		from: &str,
		challenge: ChallengeMessage,
	) -> Result<Vec<Outbound>, SyncError> {
		if !state.peers.contains(from) {
			return Err(SyncError::UnknownPeer { peer: from.to_string() });
		}
		match challenge.stage {
			ChallengeStage::Challenge => {
				let response = self.auth.respond(challenge.payload());
				let mut outbound =
					vec![Outbound::message(from, Message::challenge(ChallengeStage::Response, response))];
				// our own challenge may have been lost before the peer was listening
				let admitted = state.peers.get(from).map_or(true, Peer::is_admitted);
				if !admitted && !state.challenges.contains_key(from) && !state.failed.contains(from) {
					let nonce = self.auth.nonce();
					state.challenges.insert(from.to_string(), nonce.clone());
					outbound.push(Outbound::message(from, Message::challenge(ChallengeStage::Challenge, nonce)));
				}
				Ok(outbound)
			}
			ChallengeStage::Response => {
				let Some(nonce) = state.challenges.remove(from) else {
					debug!("Ignoring unexpected challenge response from {}", from);
					return Ok(Vec::new());
				};
				if self.auth.verify(&nonce, challenge.payload()) {
					info!("Peer {} authenticated", from);
					state.peers.set_authenticated(from, true)?;
					Ok(Vec::new())
				} else {
					warn!("Peer {} failed its challenge", from);
					state.failed.insert(from.to_string());
					state.peers.set_authenticated(from, false)?;
					Err(SyncError::AuthenticationFailed { peer: from.to_string() })
				}
			}
		}
	}

	async fn handle_update(
		&self,
		state: &mut State,
		from: &str,
		operation: Operation,
		remote: ObjectInfo,
	) -> Result<Vec<Outbound>, SyncError> {
		check_identifier(from, &remote.identification)?;
		let id = remote.identification.clone();
		if state.model.is_retired(&id) {
			if operation == Operation::Remove {
				return Ok(vec![Outbound::message(from, Message::notify(NotifyType::Removed, &id))]);
			}
			warn!("Ignoring {} of removed object {} from {}", operation, id, from);
			return Ok(Vec::new());
		}
		match (operation, state.model.is_tracked(&id)) {
			(Operation::Remove, false) => {
				Ok(vec![Outbound::message(from, Message::notify(NotifyType::Missing, &id))])
			}
			(Operation::Remove, true) => self.apply_remove(state, from, remote).await,
			(_, false) => self.apply_create(state, from, remote).await,
			(_, true) => self.apply_modify(state, from, remote).await,
		}
	}

	async fn apply_create(
		&self,
		state: &mut State,
		from: &str,
		mut object: ObjectInfo,
	) -> Result<Vec<Outbound>, SyncError> {
		if object.path.is_empty() {
			return Err(SyncError::illegal(format!("{} announced a second root", from)));
		}
		if !is_safe_subpath(&object.path) {
			return Err(SyncError::illegal(format!("{} announced unsafe path {:?}", from, object.path)));
		}
		if let Some(existing) = state.model.find_by_path(&object.path) {
			return Err(SyncError::illegal(format!(
				"{} announced {} at {}, already taken by {}",
				from, object.identification, object.path, existing.identification
			)));
		}
		let id = object.identification.clone();
		if object.directory {
			object.shadow = false;
			tokio::fs::create_dir_all(self.layout.object_path(&object.path)).await?;
			info!("Created directory {} announced by {}", object.path, from);
			state.model.track(object, ObjectState::Tracked)?;
			return Ok(Vec::new());
		}
		info!("Tracking {} announced by {}, fetching content", object.path, from);
		object.shadow = true;
		state.model.track(object, ObjectState::Tracked)?;
		Ok(self.fetch(state, from, &id, ObjectType::Object, Instant::now()))
	}

	async fn apply_modify(
		&self,
		state: &mut State,
		from: &str,
		remote: ObjectInfo,
	) -> Result<Vec<Outbound>, SyncError> {
		let id = remote.identification.clone();
		let local = state.model.get(&id).map(ObjectInfo::shallow).ok_or_else(|| SyncError::not_tracked(&id))?;
		if local.directory != remote.directory {
			return Err(SyncError::illegal(format!(
				"{} announced {} with a different type",
				from, local.path
			)));
		}

		if let Some(conflict) = state.conflicts.get(&id) {
			if !conflict.is_settled_by(&remote) {
				debug!("Conflict on {} outstanding, ignoring update from {}", local.path, from);
				return Ok(Vec::new());
			}
			info!("Conflict on {} settled by {}", local.path, from);
			if let Some(conflict) = state.conflicts.remove(&id) {
				self.put_back(&conflict).await?;
			}
			state.fetches.remove(&id);
			state.model.set_state(&id, ObjectState::Tracked)?;
		}

		if local.version == remote.version {
			debug!("Update of {} from {} already known", local.path, from);
			return Ok(Vec::new());
		}
		match local.version.validate(&remote.version, &self.self_id, self.config.validation_policy) {
			Validation::Invalid(rejection) => {
				info!("Conflict on {} with {}: {}", local.path, from, rejection);
				self.open_conflict(state, from, &local, &remote).await
			}
			Validation::Valid | Validation::AdvanceSelf(_) => {
				self.apply(state, from, &local, remote).await
			}
		}
	}

	async fn apply(
		&self,
		state: &mut State,
		from: &str,
		local: &ObjectInfo,
		remote: ObjectInfo,
	) -> Result<Vec<Outbound>, SyncError> {
		let id = &local.identification;
		if remote.path != local.path {
			state.model.relocate(id, &remote.path)?;
			if !local.shadow {
				move_path(
					&self.layout.object_path(&local.path),
					&self.layout.object_path(&remote.path),
				)
				.await?;
			}
			info!("Moved {} to {} as announced by {}", local.path, remote.path, from);
		}

		let changed = !remote.directory && remote.content != local.content;
		let object = state.model.get_mut(id).ok_or_else(|| SyncError::not_tracked(id))?;
		object.version = remote.version.clone();
		if changed {
			object.content = remote.content.clone();
			object.shadow = true;
		}
		state.model.set_state(id, ObjectState::Tracked)?;
		debug!("Applied {} from {}", remote.version, from);

		if !changed {
			return Ok(Vec::new());
		}
		state.fetches.remove(id);
		Ok(self.fetch(state, from, id, ObjectType::Object, Instant::now()))
	}

	async fn open_conflict(
		&self,
		state: &mut State,
		from: &str,
		local: &ObjectInfo,
		remote: &ObjectInfo,
	) -> Result<Vec<Outbound>, SyncError> {
		let id = local.identification.clone();
		let conflict = self.resolver.open(ConflictType::ModifyModify, from, local, remote);
		if !local.directory && !local.shadow {
			move_path(
				&self.layout.object_path(&local.path),
				&self.layout.object_path(&conflict.local_path),
			)
			.await?;
		}
		let needs_content = conflict.needs_content();
		state.conflicts.insert(conflict);
		state.model.set_state(&id, ObjectState::Conflicted)?;
		state.fetches.remove(&id);
		if !needs_content {
			return Ok(Vec::new());
		}
		Ok(self.fetch(state, from, &id, ObjectType::Object, Instant::now()))
	}

	async fn apply_remove(
		&self,
		state: &mut State,
		from: &str,
		remote: ObjectInfo,
	) -> Result<Vec<Outbound>, SyncError> {
		let id = remote.identification.clone();
		let local = state.model.get(&id).map(ObjectInfo::shallow).ok_or_else(|| SyncError::not_tracked(&id))?;
		if state.conflicts.contains(&id) {
			debug!("Conflict on {} outstanding, ignoring removal by {}", local.path, from);
			return Ok(Vec::new());
		}
		match local.version.validate(&remote.version, &self.self_id, self.config.validation_policy) {
			Validation::Invalid(rejection) => {
				info!("{} removed {} without knowing local edits: {}", from, local.path, rejection);
				let conflict = self.resolver.open(ConflictType::RemoveModify, from, &local, &remote);
				state.conflicts.insert(conflict);
				state.model.set_state(&id, ObjectState::Conflicted)?;
				Ok(Vec::new())
			}
			Validation::Valid | Validation::AdvanceSelf(_) => {
				state.model.set_state(&id, ObjectState::RemovalPending { by: from.to_string() })?;
				self.confirm_removal(state, &id).await
			}
		}
	}

	/// Remove a pending object from disk; once that worked the identifier is
	/// retired and the remover is notified. On failure it stays pending.
	async fn confirm_removal(&self, state: &mut State, id: &str) -> Result<Vec<Outbound>, SyncError> {
		let Some(ObjectState::RemovalPending { by }) = state.model.state(id).cloned() else {
			return Ok(Vec::new());
		};
		let Some(object) = state.model.get(id) else {
			return Err(SyncError::not_tracked(id));
		};
		let path = self.layout.object_path(&object.path);
		let result = if object.directory {
			tokio::fs::remove_dir_all(&path).await
		} else {
			tokio::fs::remove_file(&path).await
		};
		match result {
			Ok(()) => {}
			Err(e) if e.kind() == io::ErrorKind::NotFound => {}
			Err(e) => {
				warn!("Removal of {} failed, will retry: {}", path.display(), e);
				return Ok(Vec::new());
			}
		}
		if let Some(gone) = state.model.retire(id) {
			info!("Removed {} as requested by {}", gone.path, by);
			gone.walk(&mut |o| {
				state.fetches.remove(&o.identification);
				state.origins.remove(&o.identification);
			});
		}
		Ok(vec![Outbound::message(&by, Message::notify(NotifyType::Removed, id))])
	}

	async fn handle_request(
		&self,
		state: &mut State,
		from: &str,
		request: RequestMessage,
	) -> Result<Vec<Outbound>, SyncError> {
		let id = request.identification;
		let missing = || -> Result<Vec<Outbound>, SyncError> {
			Ok(vec![Outbound::message(from, Message::notify(NotifyType::Missing, &id))])
		};
		let path = match request.object_type {
			ObjectType::None => {
				return Err(SyncError::Unsupported { what: format!("request of type none from {}", from) })
			}
			ObjectType::Object => {
				let Some(object) = state.model.get(&id) else {
					return missing();
				};
				if object.directory {
					return Err(SyncError::Unsupported {
						what: format!("content request for directory {}", object.path),
					});
				}
				if object.shadow {
					debug!("Content of {} not here yet, ignoring request from {}", object.path, from);
					return Ok(Vec::new());
				}
				// while conflicted our copy lives under the local conflict name
				match state.conflicts.get(&id) {
					Some(conflict) => self.layout.object_path(&conflict.local_path),
					None => self.layout.object_path(&object.path),
				}
			}
			ObjectType::Model => {
				let path = self.layout.temp_dir().join(format!("{}{}", id, ENDING));
				tokio::fs::write(&path, serde_json::to_string(&state.model)?).await?;
				path
			}
			ObjectType::Peer => {
				let path = self.layout.peer_file(&id);
				if !tokio::fs::try_exists(&path).await? {
					return missing();
				}
				path
			}
		};
		Ok(vec![Outbound::Transfer {
			to: from.to_string(),
			identification: id.clone(),
			object_type: request.object_type,
			path,
		}])
	}

	async fn handle_notify(
		&self,
		state: &mut State,
		from: &str,
		notify: NotifyMessage,
	) -> Result<Vec<Outbound>, SyncError> {
		let id = notify.identification;
		if state.fetches.get(&id).is_some_and(|f| f.from == from) {
			debug!("Dropping fetch of {} from {}: {}", id, from, notify.notify);
			state.fetches.remove(&id);
		}
		let Some(object) = state.model.get(&id).map(ObjectInfo::shallow) else {
			return Ok(Vec::new());
		};
		if state.conflicts.contains(&id) {
			debug!("Conflict on {} outstanding, keeping it despite {} from {}", object.path, notify.notify, from);
			return Ok(Vec::new());
		}

		match notify.notify {
			NotifyType::Missing => {
				if object.shadow
					&& !tokio::fs::try_exists(self.layout.object_path(&object.path)).await?
				{
					info!("{} does not have {}, forgetting the placeholder", from, object.path);
					state.model.untrack(&id);
					state.origins.remove(&id);
				}
				Ok(Vec::new())
			}
			NotifyType::Removed => match state.model.state(&id).cloned() {
				Some(ObjectState::Modified) => {
					warn!("{} removed {}, keeping local edits", from, object.path);
					Ok(Vec::new())
				}
				Some(ObjectState::Tracked) => {
					state.model.set_state(&id, ObjectState::RemovalPending { by: from.to_string() })?;
					self.confirm_removal(state, &id).await
				}
				Some(ObjectState::RemovalPending { .. }) => self.confirm_removal(state, &id).await,
				_ => Ok(Vec::new()),
			},
		}
	}

	fn handle_lock(&self, state: &mut State, from: &str, action: LockAction) -> Vec<Outbound> {
		let now = Instant::now();
		match action {
			LockAction::Request => match state.locks.request(from, now) {
				LockDecision::Granted | LockDecision::AlreadyHeld => {
					vec![Outbound::message(from, Message::lock(LockAction::Accept))]
				}
				LockDecision::Queued => Vec::new(),
			},
			LockAction::Release => match state.locks.release(from, now) {
				LockRelease::Released { next: Some(next) } => {
					vec![Outbound::message(&next, Message::lock(LockAction::Accept))]
				}
				// not a holder here, so it is the granter taking its lock back
				LockRelease::NotHolder if state.waiters.release(from) => {
					warn!("{} revoked our hold of its lock", from);
					Vec::new()
				}
				_ => Vec::new(),
			},
			LockAction::Accept => {
				if state.waiters.accept(from, now) {
					Vec::new()
				} else {
					warn!("Unsolicited lock accept from {}, handing it back", from);
					vec![Outbound::message(from, Message::lock(LockAction::Release))]
				}
			}
		}
	}

	async fn handle_push(
		&self,
		state: &mut State,
		from: &str,
		push: PushMessage,
	) -> Result<Vec<Outbound>, SyncError> {
		match state.fetches.get_mut(&push.identification) {
			Some(fetch) if fetch.from == from && fetch.object_type == push.object_type => {
				fetch.pushed = true;
				tokio::fs::create_dir_all(self.layout.receiving_dir()).await?;
				debug!("Expecting {} {} from {}", push.object_type, push.identification, from);
			}
			Some(fetch) => warn!(
				"Push of {} {} from {} does not match the request to {}",
				push.object_type, push.identification, from, fetch.from
			),
			None => warn!("Unexpected push of {} from {}", push.identification, from),
		}
		Ok(Vec::new())
	}

	/// Register a fetch unless one is already running and return the request
	fn fetch(
		&self,
		state: &mut State,
		from: &str,
		id: &str,
		object_type: ObjectType,
		now: Instant,
	) -> Vec<Outbound> {
		if object_type == ObjectType::Object {
			state.origins.insert(id.to_string(), from.to_string());
		}
		if state.fetches.get(id).is_some_and(|f| f.deadline > now) {
			return Vec::new();
		}
		state.fetches.insert(
			id.to_string(),
			Fetch {
				from: from.to_string(),
				object_type,
				deadline: now + self.config.fetch_timeout(),
				pushed: false,
			},
		);
		vec![Outbound::message(from, Message::request(object_type, id))]
	}

	// ========================================================================
	// TRANSFERS
	// ========================================================================

	/// Ask `from` for its whole model; received objects are applied as updates
	pub async fn request_model(&self, from: &str) -> Vec<Outbound> {
		let mut state = self.state.lock().await;
		self.fetch(&mut state, from, from, ObjectType::Model, Instant::now())
	}

	/// Ask `from` for the record of peer `id`
	pub async fn request_peer(&self, from: &str, id: &str) -> Vec<Outbound> {
		let mut state = self.state.lock().await;
		self.fetch(&mut state, from, id, ObjectType::Peer, Instant::now())
	}

	/// A transfer has been written to the staging path of `id`
	pub async fn complete_transfer(&self, from: &str, id: &str) -> Result<Vec<Outbound>, SyncError> {
		check_identifier(from, id)?;
		let mut state = self.state.lock().await;
		let staged = self.layout.staging_path(id);
		let fetch = state.fetches.get(id).cloned();
		if fetch.as_ref().is_some_and(|f| !f.pushed) {
			debug!("Transfer of {} completed without a push", id);
		}
		match fetch.map(|f| f.object_type).unwrap_or(ObjectType::Object) {
			ObjectType::Model => {
				let data = tokio::fs::read_to_string(&staged).await?;
				discard(&staged).await;
				state.fetches.remove(id);
				let remote: Model = serde_json::from_str(&data)?;
				self.replay_model(&mut state, from, &remote).await
			}
			ObjectType::Peer => {
				let data = tokio::fs::read_to_string(&staged).await?;
				discard(&staged).await;
				state.fetches.remove(id);
				let peer: Peer = json5::from_str(&data)?;
				check_identifier(from, &peer.identification)?;
				if peer.identification != self.self_id {
					info!("Learned peer {} ({}) from {}", peer.name, peer.identification, from);
					peer.store(&self.layout).await?;
					state.peers.insert(peer);
				}
				Ok(Vec::new())
			}
			_ => self.receive_object(&mut state, from, id, &staged).await,
		}
	}

	async fn receive_object(
		&self,
		state: &mut State,
		from: &str,
		id: &str,
		staged: &Path,
	) -> Result<Vec<Outbound>, SyncError> {
		if let Some(conflict) = state.conflicts.get_mut(id) {
			if conflict.needs_content() {
				verify(staged, &conflict.remote.content).await?;
				place(staged, &self.layout.object_path(&conflict.remote_path)).await?;
				conflict.materialized = true;
				info!("Incoming copy of {} stored as {}", conflict.local.path, conflict.remote_path);
				state.fetches.remove(id);
				return Ok(Vec::new());
			}
		}
		let Some(object) = state.model.get_mut(id) else {
			warn!("Dropping unexpected transfer of {} from {}", id, from);
			discard(staged).await;
			return Ok(Vec::new());
		};
		if !object.shadow {
			debug!("Content of {} already present", object.path);
			discard(staged).await;
			state.fetches.remove(id);
			return Ok(Vec::new());
		}
		verify(staged, &object.content).await?;
		place(staged, &self.layout.object_path(&object.path)).await?;
		object.shadow = false;
		info!("Received {} from {}", object.path, from);
		state.fetches.remove(id);
		Ok(Vec::new())
	}

	async fn replay_model(
		&self,
		state: &mut State,
		from: &str,
		remote: &Model,
	) -> Result<Vec<Outbound>, SyncError> {
		let mut outbound = Vec::new();
		// sorted by path, so parents come before their children
		for object in remote.objects().into_iter().filter(|o| !o.path.is_empty()) {
			match self.handle_update(state, from, Operation::Create, object.shallow()).await {
				Ok(mut out) => outbound.append(&mut out),
				Err(e) => warn!("Skipping {} from the model of {}: {}", object.path, from, e),
			}
		}
		Ok(outbound)
	}

	// ========================================================================
	// LOCAL CHANGES
	// ========================================================================

	/// Start tracking a new file or directory tree found at `path`
	pub async fn local_create(&self, path: &str) -> Result<Vec<Outbound>, SyncError> {
		if !is_safe_subpath(path) {
			return Err(SyncError::illegal(format!("{:?} cannot be tracked", path)));
		}
		let mut state = self.state.lock().await;
		if state.model.find_by_path(path).is_some() {
			return Err(SyncError::illegal(format!("{} is already tracked", path)));
		}
		let mut object = ObjectInfo::from_path(self.layout.root(), path).await?;
		stamp(&mut object, &self.self_id);
		let announced: Vec<ObjectInfo> = object.flatten().into_iter().map(ObjectInfo::shallow).collect();
		state.model.track(object, ObjectState::Modified)?;
		info!("Tracking new {} ({} objects)", path, announced.len());
		Ok(self.broadcast(
			&state,
			announced.into_iter().map(|o| Message::update(Operation::Create, o)).collect(),
		))
	}

	/// Record new content of the file at `path`
	pub async fn local_modify(&self, path: &str) -> Result<Vec<Outbound>, SyncError> {
		let mut state = self.state.lock().await;
		let object = self.mutable(&state, path)?;
		if object.directory {
			return Ok(Vec::new());
		}
		let content = util::content_hash(&self.layout.object_path(path)).await?;
		if content == object.content {
			debug!("{} unchanged", path);
			return Ok(Vec::new());
		}
		let id = object.identification;
		let object = state.model.get_mut(&id).ok_or_else(|| SyncError::not_tracked(&id))?;
		object.content = content;
		object.version.increase(&self.self_id);
		let announced = object.shallow();
		state.model.set_state(&id, ObjectState::Modified)?;
		Ok(self.broadcast(&state, vec![Message::update(Operation::Modify, announced)]))
	}

	/// Record that `from` has been moved to `to`
	pub async fn local_rename(&self, from: &str, to: &str) -> Result<Vec<Outbound>, SyncError> {
		let mut state = self.state.lock().await;
		let id = self.mutable(&state, from)?.identification;
		state.model.relocate(&id, to)?;
		let object = state.model.get_mut(&id).ok_or_else(|| SyncError::not_tracked(&id))?;
		object.version.increase(&self.self_id);
		let announced = object.shallow();
		state.model.set_state(&id, ObjectState::Modified)?;
		info!("Renamed {} to {}", from, to);
		Ok(self.broadcast(&state, vec![Message::update(Operation::Modify, announced)]))
	}

	/// Record that `path` has been removed
	pub async fn local_remove(&self, path: &str) -> Result<Vec<Outbound>, SyncError> {
		let mut state = self.state.lock().await;
		let id = self.mutable(&state, path)?.identification;
		let mut gone = state.model.retire(&id).ok_or_else(|| SyncError::not_tracked(&id))?;
		gone.walk(&mut |o| {
			state.fetches.remove(&o.identification);
			state.origins.remove(&o.identification);
		});
		gone.version.increase(&self.self_id);
		info!("Removed {}", path);
		Ok(self.broadcast(&state, vec![Message::update(Operation::Remove, gone.shallow())]))
	}

	/// The object at `path`, if it may be changed locally
	fn mutable(&self, state: &State, path: &str) -> Result<ObjectInfo, SyncError> {
		if path.is_empty() {
			return Err(SyncError::illegal("the root cannot be changed"));
		}
		let object = state
			.model
			.find_by_path(path)
			.map(ObjectInfo::shallow)
			.ok_or_else(|| SyncError::not_tracked(path))?;
		if object.shadow {
			return Err(SyncError::illegal(format!("content of {} has not been fetched yet", path)));
		}
		match state.model.state(&object.identification) {
			Some(ObjectState::Conflicted) => {
				Err(SyncError::Conflict { identification: object.identification })
			}
			Some(ObjectState::RemovalPending { by }) => {
				Err(SyncError::illegal(format!("{} is being removed by {}", path, by)))
			}
			_ => Ok(object),
		}
	}

	fn broadcast(&self, state: &State, messages: Vec<Message>) -> Vec<Outbound> {
		let peers = state.peers.others(&self.self_id);
		let mut outbound = Vec::with_capacity(peers.len() * messages.len());
		for peer in &peers {
			for message in &messages {
				outbound.push(Outbound::message(peer, message.clone()));
			}
		}
		outbound
	}

	// ========================================================================
	// CONFLICTS
	// ========================================================================

	/// Settle the conflict on `id` and announce the outcome
	pub async fn resolve_conflict(
		&self,
		id: &str,
		resolution: Resolution,
	) -> Result<Vec<Outbound>, SyncError> {
		let mut state = self.state.lock().await;
		let conflict = state.conflicts.get(id).cloned().ok_or_else(|| SyncError::not_tracked(id))?;
		let resolved = self.resolver.resolve(&conflict, resolution, &self.self_id)?;
		info!("Resolving {} with {}", conflict, resolution);

		match (conflict.conflict_type, resolution) {
			(ConflictType::RemoveModify, Resolution::KeepRemote) => {
				state.conflicts.remove(id);
				state.model.set_state(id, ObjectState::RemovalPending { by: conflict.peer.clone() })?;
				self.confirm_removal(&mut state, id).await
			}
			(ConflictType::RemoveModify, Resolution::KeepLocal) => {
				// the identifier is gone elsewhere, announce the content under a new one
				state.conflicts.remove(id);
				let mut object = state.model.retire(id).ok_or_else(|| SyncError::not_tracked(id))?;
				reidentify(&mut object, &self.self_id);
				let announced: Vec<ObjectInfo> =
					object.flatten().into_iter().map(ObjectInfo::shallow).collect();
				state.model.track(object, ObjectState::Modified)?;
				Ok(self.broadcast(
					&state,
					announced.into_iter().map(|o| Message::update(Operation::Create, o)).collect(),
				))
			}
			(ConflictType::ModifyModify, _) => {
				let path = self.layout.object_path(&conflict.local.path);
				if let Some(restore) = &resolved.restore {
					move_path(&self.layout.object_path(restore), &path).await?;
				}
				if let Some(other) = &resolved.discard {
					discard(&self.layout.object_path(other)).await;
				}
				state.conflicts.remove(id);
				state.fetches.remove(id);
				let object = state.model.get_mut(id).ok_or_else(|| SyncError::not_tracked(id))?;
				object.version = resolved.version;
				object.content = resolved.content;
				if resolution == Resolution::KeepRemote {
					object.shadow = false;
				}
				let announced = object.shallow();
				state.model.set_state(id, ObjectState::Modified)?;
				Ok(self.broadcast(&state, vec![Message::update(Operation::Modify, announced)]))
			}
		}
	}

	/// Undo the on-disk effects of a conflict settled elsewhere
	async fn put_back(&self, conflict: &Conflict) -> Result<(), SyncError> {
		if conflict.local_path != conflict.local.path && !conflict.local.shadow {
			move_path(
				&self.layout.object_path(&conflict.local_path),
				&self.layout.object_path(&conflict.local.path),
			)
			.await?;
		}
		if !conflict.remote_path.is_empty() {
			discard(&self.layout.object_path(&conflict.remote_path)).await;
		}
		Ok(())
	}

	// ========================================================================
	// LOCKS
	// ========================================================================

	/// Request the lock of `to` and wait for its accept
	pub async fn acquire_lock(&self, to: &str, transport: &dyn Transport) -> Result<(), SyncError> {
		let accepted = {
			let mut state = self.state.lock().await;
			if state.waiters.holds(to, self.config.lock_lease(), Instant::now()) {
				return Ok(());
			}
			state.waiters.wait(to)
		};
		transport.send(to, &Message::lock(LockAction::Request)).await?;
		match tokio::time::timeout(self.config.lock_timeout(), accepted).await {
			Ok(Ok(())) => {
				info!("Holding the lock of {}", to);
				Ok(())
			}
			Ok(Err(_)) => Err(SyncError::illegal(format!("lock wait on {} was superseded", to))),
			Err(_) => {
				self.state.lock().await.waiters.cancel(to);
				// withdraw from the queue; a late accept is handed back as well
				if let Err(e) = transport.send(to, &Message::lock(LockAction::Release)).await {
					warn!("Could not withdraw lock request at {}: {}", to, e);
				}
				Err(SyncError::Timeout { what: format!("lock of {}", to) })
			}
		}
	}

	pub async fn release_lock(&self, to: &str, transport: &dyn Transport) -> Result<(), SyncError> {
		if !self.state.lock().await.waiters.release(to) {
			return Err(SyncError::illegal(format!("no lock held at {}", to)));
		}
		transport.send(to, &Message::lock(LockAction::Release)).await?;
		Ok(())
	}

	// ========================================================================
	// HOUSEKEEPING
	// ========================================================================

	pub async fn tick(&self) -> Result<Vec<Outbound>, SyncError> {
		self.tick_at(Instant::now()).await
	}

	/// Expire fetches and lock grants, retry removals and missing content
	pub async fn tick_at(&self, now: Instant) -> Result<Vec<Outbound>, SyncError> {
		let mut state = self.state.lock().await;
		let mut outbound = Vec::new();

		let expired: Vec<String> =
			state.fetches.iter().filter(|(_, f)| f.deadline <= now).map(|(id, _)| id.clone()).collect();
		for id in expired {
			if let Some(fetch) = state.fetches.remove(&id) {
				warn!("Fetch of {} {} from {} timed out", fetch.object_type, id, fetch.from);
			}
		}

		if let Some((expired, next)) = state.locks.expire(self.config.lock_lease(), now) {
			outbound.push(Outbound::message(&expired, Message::lock(LockAction::Release)));
			if let Some(next) = next {
				outbound.push(Outbound::message(&next, Message::lock(LockAction::Accept)));
			}
		}
		state.waiters.expire(self.config.lock_lease(), now);

		for (id, _) in state.model.pending_removals() {
			outbound.extend(self.confirm_removal(&mut state, &id).await?);
		}

		let mut retries: Vec<(String, String)> = state
			.conflicts
			.iter()
			.filter(|c| c.needs_content())
			.map(|c| (c.identification.clone(), c.peer.clone()))
			.collect();
		for id in state.model.shadows() {
			if state.conflicts.contains(&id) {
				continue;
			}
			if let Some(origin) = state.origins.get(&id) {
				retries.push((id.clone(), origin.clone()));
			}
		}
		for (id, origin) in retries {
			if !state.fetches.contains_key(&id) {
				debug!("Asking {} again for {}", origin, id);
				outbound.extend(self.fetch(&mut state, &origin, &id, ObjectType::Object, now));
			}
		}
		Ok(outbound)
	}
}

/// Identifiers end up in file names below the marker directory
fn check_identifier(from: &str, identification: &str) -> Result<(), SyncError> {
	if is_valid_identifier(identification) {
		return Ok(());
	}
	warn!("Refusing malformed identifier {:?} from {}", identification, from);
	Err(SyncError::illegal(format!("malformed identifier {:?}", identification)))
}

fn admit(state: &State, from: &str) -> Result<(), SyncError> {
	let peer = state.peers.get(from).ok_or_else(|| SyncError::UnknownPeer { peer: from.to_string() })?;
	if state.failed.contains(from) {
		return Err(SyncError::AuthenticationFailed { peer: from.to_string() });
	}
	if !peer.is_admitted() {
		return Err(SyncError::Unauthenticated { peer: from.to_string() });
	}
	Ok(())
}

/// Give every object of a new tree its first version
fn stamp(object: &mut ObjectInfo, self_id: &str) {
	object.version.increase(self_id);
	for child in &mut object.objects {
		stamp(child, self_id);
	}
}

/// Fresh identifiers and versions for a whole tree
fn reidentify(object: &mut ObjectInfo, self_id: &str) {
	object.identification = util::new_identifier();
	object.version = VersionVector::new();
	object.version.increase(self_id);
	for child in &mut object.objects {
		reidentify(child, self_id);
	}
}

async fn verify(staged: &Path, expected: &str) -> Result<(), SyncError> {
	let actual = util::content_hash(staged).await?;
	if actual != expected {
		discard(staged).await;
		return Err(SyncError::HashMismatch { expected: expected.to_string(), actual });
	}
	Ok(())
}

async fn place(staged: &Path, target: &Path) -> Result<(), SyncError> {
	if let Some(parent) = target.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	tokio::fs::rename(staged, target).await?;
	Ok(())
}

/// Rename on disk; a missing source is not an error
async fn move_path(from: &Path, to: &Path) -> Result<(), SyncError> {
	if let Some(parent) = to.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	match tokio::fs::rename(from, to).await {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			debug!("Nothing to move at {}", from.display());
			Ok(())
		}
		Err(e) => Err(e.into()),
	}
}

async fn discard(path: &Path) {
	if let Err(e) = tokio::fs::remove_file(path).await {
		if e.kind() != io::ErrorKind::NotFound {
			warn!("Could not remove {}: {}", path.display(), e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::ChallengeStage;
	use std::time::Duration;

	const SECRET: [u8; 32] = [3; 32];

	async fn fixture(trusted: bool) -> (tempfile::TempDir, Coordinator) {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		for d in [layout.peers_dir(), layout.local_dir(), layout.temp_dir(), layout.receiving_dir()] {
			std::fs::create_dir_all(d).unwrap();
		}
		std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
		let model = Model::scan(&layout).await.unwrap();
		let coordinator = Coordinator::new(
			"a",
			layout,
			model,
			peers(trusted),
			Authenticator::new(SECRET),
			Config::default(),
		);
		(dir, coordinator)
	}

	fn peers(trusted: bool) -> PeerRegistry {
		let mut peers = PeerRegistry::new();
		let mut bob = Peer::new("bob", "addr-b", trusted);
		bob.identification = "b".into();
		peers.insert(bob);
		peers
	}

	/// Open the replica again from what `c` left on disk
	async fn restart(c: Coordinator) -> Coordinator {
		let layout = c.layout().clone();
		drop(c);
		let model = Model::load(&layout).await.unwrap().unwrap();
		let restarted =
			Coordinator::new("a", layout, model, peers(false), Authenticator::new(SECRET), Config::default());
		restarted.restore().await.unwrap();
		restarted
	}

	/// Edit a.txt locally and receive a concurrent edit from b
	async fn conflicted(dir: &tempfile::TempDir, c: &Coordinator) -> String {
		let base = c.object_at("a.txt").await.unwrap();
		std::fs::write(dir.path().join("a.txt"), b"local").unwrap();
		c.local_modify("a.txt").await.unwrap();
		let mut remote = base.clone();
		remote.content = util::hash(b"remote");
		remote.version.increase("b");
		c.handle("b", Message::update(Operation::Modify, remote)).await.unwrap();
		assert_eq!(c.state_of(&base.identification).await, Some(ObjectState::Conflicted));
		base.identification
	}

	async fn holds(c: &Coordinator, peer: &str) -> bool {
		c.state.lock().await.waiters.holds(peer, c.config().lock_lease(), Instant::now())
	}

	fn to_b(message: Message) -> Outbound {
		Outbound::Message { to: "b".into(), message }
	}

	#[tokio::test]
	async fn test_unknown_peer_rejected() {
		let (_dir, c) = fixture(false).await;
		let err = c.handle("ghost", Message::lock(LockAction::Request)).await.unwrap_err();
		assert!(matches!(err, SyncError::UnknownPeer { .. }));
	}

	#[tokio::test]
	async fn test_create_fetches_and_places_content() {
		let (dir, c) = fixture(false).await;
		let mut object = ObjectInfo::new_file("new.txt", "new.txt", &util::hash(b"fresh"));
		object.version.increase("b");
		let id = object.identification.clone();

		let out = c.handle("b", Message::update(Operation::Create, object)).await.unwrap();
		assert_eq!(out, vec![to_b(Message::request(ObjectType::Object, &id))]);
		assert!(c.object_at("new.txt").await.unwrap().shadow);

		c.handle("b", Message::push(&id, ObjectType::Object)).await.unwrap();
		std::fs::write(c.layout().staging_path(&id), b"fresh").unwrap();
		c.complete_transfer("b", &id).await.unwrap();

		assert!(!c.object_at("new.txt").await.unwrap().shadow);
		assert_eq!(std::fs::read(dir.path().join("new.txt")).unwrap(), b"fresh");
		assert!(c.pending_fetches().await.is_empty());
	}

	#[tokio::test]
	async fn test_tampered_content_is_refused() {
		let (dir, c) = fixture(false).await;
		let object = ObjectInfo::new_file("new.txt", "new.txt", &util::hash(b"fresh"));
		let id = object.identification.clone();
		c.handle("b", Message::update(Operation::Create, object)).await.unwrap();

		std::fs::write(c.layout().staging_path(&id), b"tampered").unwrap();
		let err = c.complete_transfer("b", &id).await.unwrap_err();
		assert!(matches!(err, SyncError::HashMismatch { .. }));
		assert!(c.object_at("new.txt").await.unwrap().shadow);
		assert!(!dir.path().join("new.txt").exists());
		assert!(!c.layout().staging_path(&id).exists());
		assert_eq!(c.pending_fetches().await, vec![id]);
	}

	#[tokio::test]
	async fn test_create_on_taken_path_fails() {
		let (_dir, c) = fixture(false).await;
		let object = ObjectInfo::new_file("a.txt", "a.txt", "other");
		let err = c.handle("b", Message::update(Operation::Create, object)).await.unwrap_err();
		assert!(matches!(err, SyncError::IllegalState { .. }));
	}

	#[tokio::test]
	async fn test_remove_is_confirmed_and_idempotent() {
		let (dir, c) = fixture(false).await;
		let mut remote = c.object_at("a.txt").await.unwrap();
		remote.version.increase("b");
		let id = remote.identification.clone();
		let removed = vec![to_b(Message::notify(NotifyType::Removed, &id))];

		let out = c.handle("b", Message::update(Operation::Remove, remote.clone())).await.unwrap();
		assert_eq!(out, removed);
		assert!(!dir.path().join("a.txt").exists());
		assert!(c.state_of(&id).await.is_none());

		let out = c.handle("b", Message::update(Operation::Remove, remote.clone())).await.unwrap();
		assert_eq!(out, removed);

		// a late modify cannot bring it back
		let out = c.handle("b", Message::update(Operation::Modify, remote)).await.unwrap();
		assert!(out.is_empty());
		assert!(c.object_at("a.txt").await.is_none());
	}

	#[tokio::test]
	async fn test_remove_of_unknown_reports_missing() {
		let (_dir, c) = fixture(false).await;
		let ghost = ObjectInfo::new_file("g", "g", "h");
		let out = c.handle("b", Message::update(Operation::Remove, ghost.clone())).await.unwrap();
		assert_eq!(out, vec![to_b(Message::notify(NotifyType::Missing, &ghost.identification))]);
	}

	#[tokio::test]
	async fn test_remove_of_local_edit_is_a_conflict() {
		let (dir, c) = fixture(false).await;
		let before = c.object_at("a.txt").await.unwrap();
		std::fs::write(dir.path().join("a.txt"), b"edited").unwrap();
		c.local_modify("a.txt").await.unwrap();

		let mut remote = before;
		remote.version.increase("b");
		let out = c.handle("b", Message::update(Operation::Remove, remote.clone())).await.unwrap();
		assert!(out.is_empty());
		assert!(dir.path().join("a.txt").exists());
		assert_eq!(c.state_of(&remote.identification).await, Some(ObjectState::Conflicted));
		assert_eq!(c.conflicts().await[0].conflict_type, ConflictType::RemoveModify);
	}

	#[tokio::test]
	async fn test_concurrent_edit_conflict_and_resolution() {
		let (dir, c) = fixture(false).await;
		let base = c.object_at("a.txt").await.unwrap();
		let id = base.identification.clone();

		std::fs::write(dir.path().join("a.txt"), b"local").unwrap();
		let out = c.local_modify("a.txt").await.unwrap();
		assert_eq!(out.len(), 1);

		let mut remote = base.clone();
		remote.content = util::hash(b"remote");
		remote.version.increase("b");
		let out = c.handle("b", Message::update(Operation::Modify, remote)).await.unwrap();
		assert_eq!(out, vec![to_b(Message::request(ObjectType::Object, &id))]);
		assert_eq!(c.state_of(&id).await, Some(ObjectState::Conflicted));
		assert!(!dir.path().join("a.txt").exists());
		assert_eq!(std::fs::read(dir.path().join("a.LOCAL.txt")).unwrap(), b"local");

		let err = c.local_modify("a.txt").await.unwrap_err();
		assert!(matches!(err, SyncError::Conflict { .. }));

		std::fs::write(c.layout().staging_path(&id), b"remote").unwrap();
		c.complete_transfer("b", &id).await.unwrap();
		assert_eq!(std::fs::read(dir.path().join("a.REMOTE.txt")).unwrap(), b"remote");

		let out = c.resolve_conflict(&id, Resolution::KeepRemote).await.unwrap();
		let Outbound::Message { message: Message::Update(update), .. } = &out[0] else {
			panic!("expected an update, got {:?}", out);
		};
		assert_eq!(update.operation, Operation::Modify);
		assert_eq!(update.object.version, [("a", 2), ("b", 1)].into_iter().collect());
		assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"remote");
		assert!(!dir.path().join("a.LOCAL.txt").exists());
		assert!(!dir.path().join("a.REMOTE.txt").exists());
		assert_eq!(c.state_of(&id).await, Some(ObjectState::Modified));
		assert!(c.conflicts().await.is_empty());
	}

	#[tokio::test]
	async fn test_requests() {
		let (dir, c) = fixture(false).await;
		let a = c.object_at("a.txt").await.unwrap();

		let out = c.handle("b", Message::request(ObjectType::Object, &a.identification)).await.unwrap();
		assert_eq!(
			out,
			vec![Outbound::Transfer {
				to: "b".into(),
				identification: a.identification.clone(),
				object_type: ObjectType::Object,
				path: dir.path().join("a.txt"),
			}]
		);

		let out = c.handle("b", Message::request(ObjectType::Object, "nope")).await.unwrap();
		assert_eq!(out, vec![to_b(Message::notify(NotifyType::Missing, "nope"))]);

		let err = c.handle("b", Message::request(ObjectType::None, "x")).await.unwrap_err();
		assert!(matches!(err, SyncError::Unsupported { .. }));

		let out = c.handle("b", Message::request(ObjectType::Model, "snap")).await.unwrap();
		let Outbound::Transfer { path, .. } = &out[0] else {
			panic!("expected a transfer");
		};
		let shared: Model = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
		assert!(shared.find_by_path("a.txt").is_some());
	}

	#[tokio::test]
	async fn test_challenge_admits_trusted_peer() {
		let (_dir, c) = fixture(true).await;
		let out = c.begin_session("b").await.unwrap();
		let Outbound::Message { message: Message::Challenge(challenge), .. } = &out[0] else {
			panic!("expected a challenge");
		};
		let nonce = challenge.payload().to_vec();

		let err = c.handle("b", Message::lock(LockAction::Request)).await.unwrap_err();
		assert!(matches!(err, SyncError::Unauthenticated { .. }));

		let response = Authenticator::new(SECRET).respond(&nonce);
		c.handle("b", Message::challenge(ChallengeStage::Response, response)).await.unwrap();
		assert!(c.peer("b").await.unwrap().authenticated);
		c.handle("b", Message::lock(LockAction::Request)).await.unwrap();
	}

	#[tokio::test]
	async fn test_wrong_response_fails_session() {
		let (_dir, c) = fixture(true).await;
		let out = c.begin_session("b").await.unwrap();
		let Outbound::Message { message: Message::Challenge(challenge), .. } = &out[0] else {
			panic!("expected a challenge");
		};
		let response = Authenticator::new([9; 32]).respond(challenge.payload());
		let err = c.handle("b", Message::challenge(ChallengeStage::Response, response)).await.unwrap_err();
		assert!(err.is_fatal_for_session());

		let err = c.handle("b", Message::lock(LockAction::Request)).await.unwrap_err();
		assert!(matches!(err, SyncError::AuthenticationFailed { .. }));

		// a new session starts over
		c.begin_session("b").await.unwrap();
		let err = c.handle("b", Message::lock(LockAction::Request)).await.unwrap_err();
		assert!(matches!(err, SyncError::Unauthenticated { .. }));
	}

	#[tokio::test]
	async fn test_answers_challenges() {
		let (_dir, c) = fixture(false).await;
		let out = c.handle("b", Message::challenge(ChallengeStage::Challenge, vec![1; 32])).await.unwrap();
		let expected = Authenticator::new(SECRET).respond(&[1; 32]);
		assert_eq!(out, vec![to_b(Message::challenge(ChallengeStage::Response, expected))]);
	}

	#[tokio::test]
	async fn test_lock_queue() {
		let (_dir, c) = fixture(false).await;
		let carol = Peer::new("carol", "addr-c", false);
		let carol_id = carol.identification.clone();
		c.add_peer(carol).await.unwrap();

		let out = c.handle("b", Message::lock(LockAction::Request)).await.unwrap();
		assert_eq!(out, vec![to_b(Message::lock(LockAction::Accept))]);
		assert!(c.handle(&carol_id, Message::lock(LockAction::Request)).await.unwrap().is_empty());
		assert_eq!(c.lock_holder().await.as_deref(), Some("b"));

		let out = c.handle("b", Message::lock(LockAction::Release)).await.unwrap();
		assert_eq!(
			out,
			vec![Outbound::Message { to: carol_id.clone(), message: Message::lock(LockAction::Accept) }]
		);
		assert_eq!(c.lock_holder().await, Some(carol_id));
	}

	#[tokio::test]
	async fn test_unsolicited_accept_is_handed_back() {
		let (_dir, c) = fixture(false).await;
		let out = c.handle("b", Message::lock(LockAction::Accept)).await.unwrap();
		assert_eq!(out, vec![to_b(Message::lock(LockAction::Release))]);
	}

	#[tokio::test]
	async fn test_tick_retries_expired_fetch() {
		let (_dir, c) = fixture(false).await;
		let object = ObjectInfo::new_file("new.txt", "new.txt", "h");
		let id = object.identification.clone();
		c.handle("b", Message::update(Operation::Create, object)).await.unwrap();

		assert!(c.tick().await.unwrap().is_empty());
		let later = Instant::now() + c.config().fetch_timeout() + Duration::from_secs(1);
		let out = c.tick_at(later).await.unwrap();
		assert_eq!(out, vec![to_b(Message::request(ObjectType::Object, &id))]);
		assert_eq!(c.pending_fetches().await, vec![id]);
	}

	#[tokio::test]
	async fn test_local_changes_are_broadcast() {
		let (dir, c) = fixture(false).await;
		std::fs::create_dir(dir.path().join("docs")).unwrap();
		std::fs::write(dir.path().join("docs/n.txt"), b"n").unwrap();

		let out = c.local_create("docs").await.unwrap();
		let paths: Vec<String> = out
			.iter()
			.filter_map(|o| match o {
				Outbound::Message { message: Message::Update(u), .. } => Some(u.object.path.clone()),
				_ => None,
			})
			.collect();
		assert_eq!(paths, vec!["docs", "docs/n.txt"]);

		let out = c.local_rename("docs/n.txt", "n.txt").await.unwrap();
		assert_eq!(out.len(), 1);
		assert!(c.object_at("n.txt").await.is_some());

		let out = c.local_remove("a.txt").await.unwrap();
		let Outbound::Message { message: Message::Update(update), .. } = &out[0] else {
			panic!("expected an update");
		};
		assert_eq!(update.operation, Operation::Remove);
		assert_eq!(update.object.version.get("a"), Some(1));
		assert!(c.local_remove("a.txt").await.is_err());
	}

	#[tokio::test]
	async fn test_malformed_identifiers_are_refused() {
		let (dir, c) = fixture(false).await;
		std::fs::write(c.layout().auth_file(), b"{\"secret\": \"AwMD\"}").unwrap();

		let err = c.handle("b", Message::request(ObjectType::Peer, "../../local/auth")).await.unwrap_err();
		assert!(matches!(err, SyncError::IllegalState { .. }));

		let err = c.handle("b", Message::request(ObjectType::Model, "../../x")).await.unwrap_err();
		assert!(matches!(err, SyncError::IllegalState { .. }));
		assert!(!dir.path().join("x.json").exists());

		assert!(c.handle("b", Message::notify(NotifyType::Missing, "a/b")).await.is_err());
		assert!(c.handle("b", Message::push("../../local/model", ObjectType::Object)).await.is_err());

		let object = ObjectInfo { identification: "../evil".into(), ..ObjectInfo::new_file("e", "e", "h") };
		assert!(c.handle("b", Message::update(Operation::Create, object)).await.is_err());
		assert!(c.object_at("e").await.is_none());

		std::fs::write(c.layout().local_dir().join("model"), b"staged").unwrap();
		let err = c.complete_transfer("b", "../local/model").await.unwrap_err();
		assert!(matches!(err, SyncError::IllegalState { .. }));
		assert!(c.layout().local_dir().join("model").exists());
		assert!(c.pending_fetches().await.is_empty());
	}

	#[tokio::test]
	async fn test_paths_outside_the_tree_are_refused() {
		let (dir, c) = fixture(false).await;
		let escape = format!("../{}-escape", dir.path().file_name().unwrap().to_string_lossy());

		let object = ObjectInfo::new_directory("escape", &escape);
		let err = c.handle("b", Message::update(Operation::Create, object)).await.unwrap_err();
		assert!(matches!(err, SyncError::IllegalState { .. }));
		assert!(!dir.path().join(&escape).exists());

		for path in [".meshsync/local/model.json", "/tmp/absolute", "docs/./a", ".meshsync"] {
			let object = ObjectInfo::new_file("f", path, &util::hash(b"evil"));
			let err = c.handle("b", Message::update(Operation::Create, object)).await.unwrap_err();
			assert!(matches!(err, SyncError::IllegalState { .. }), "{} was accepted", path);
		}
		assert!(c.pending_fetches().await.is_empty());
		assert!(!c.layout().model_file().exists());

		// a rename onto the marker directory is refused as well
		let mut moved = c.object_at("a.txt").await.unwrap();
		moved.version.increase("b");
		moved.path = ".meshsync/local/auth.json".into();
		assert!(c.handle("b", Message::update(Operation::Modify, moved)).await.is_err());
		assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"alpha");
		assert!(c.object_at("a.txt").await.is_some());

		assert!(c.local_create("../outside").await.is_err());
	}

	#[tokio::test]
	async fn test_conflict_survives_restart() {
		let (dir, c) = fixture(false).await;
		let id = conflicted(&dir, &c).await;
		c.save().await.unwrap();

		let c = restart(c).await;
		assert_eq!(c.state_of(&id).await, Some(ObjectState::Conflicted));
		assert_eq!(c.conflicts().await.len(), 1);
		// the incoming copy is asked for again
		assert_eq!(c.tick().await.unwrap(), vec![to_b(Message::request(ObjectType::Object, &id))]);

		std::fs::write(c.layout().staging_path(&id), b"remote").unwrap();
		c.complete_transfer("b", &id).await.unwrap();
		c.resolve_conflict(&id, Resolution::KeepLocal).await.unwrap();
		assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"local");
		assert!(!dir.path().join("a.LOCAL.txt").exists());
		assert!(!dir.path().join("a.REMOTE.txt").exists());
	}

	#[tokio::test]
	async fn test_lost_conflict_record_puts_local_copy_back() {
		let (dir, c) = fixture(false).await;
		let id = conflicted(&dir, &c).await;
		c.save().await.unwrap();
		std::fs::remove_file(c.layout().pending_file()).unwrap();

		let c = restart(c).await;
		assert!(c.conflicts().await.is_empty());
		assert_eq!(c.state_of(&id).await, Some(ObjectState::Modified));
		assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"local");
		assert!(!dir.path().join("a.LOCAL.txt").exists());

		std::fs::write(dir.path().join("a.txt"), b"again").unwrap();
		assert_eq!(c.local_modify("a.txt").await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_shadow_fetch_resumes_after_restart() {
		let (_dir, c) = fixture(false).await;
		let object = ObjectInfo::new_file("new.txt", "new.txt", &util::hash(b"fresh"));
		let id = object.identification.clone();
		c.handle("b", Message::update(Operation::Create, object)).await.unwrap();
		c.save().await.unwrap();

		let c = restart(c).await;
		assert!(c.object_at("new.txt").await.unwrap().shadow);
		assert_eq!(c.tick().await.unwrap(), vec![to_b(Message::request(ObjectType::Object, &id))]);
	}

	#[tokio::test]
	async fn test_expired_lease_is_revoked() {
		let (_dir, c) = fixture(false).await;
		let carol = Peer::new("carol", "addr-c", false);
		let carol_id = carol.identification.clone();
		c.add_peer(carol).await.unwrap();

		c.handle("b", Message::lock(LockAction::Request)).await.unwrap();
		c.handle(&carol_id, Message::lock(LockAction::Request)).await.unwrap();
		let later = Instant::now() + c.config().lock_lease() + Duration::from_secs(1);
		let out = c.tick_at(later).await.unwrap();
		assert_eq!(
			out,
			vec![
				to_b(Message::lock(LockAction::Release)),
				Outbound::Message { to: carol_id.clone(), message: Message::lock(LockAction::Accept) },
			]
		);
		assert_eq!(c.lock_holder().await, Some(carol_id));
	}

	#[tokio::test]
	async fn test_revoked_lock_is_no_longer_held() {
		let (_dir, c) = fixture(false).await;
		let _accepted = c.state.lock().await.waiters.wait("b");
		assert!(c.handle("b", Message::lock(LockAction::Accept)).await.unwrap().is_empty());
		assert!(holds(&c, "b").await);

		// b expired our lease and took the lock back
		assert!(c.handle("b", Message::lock(LockAction::Release)).await.unwrap().is_empty());
		assert!(!holds(&c, "b").await);

		// without a revoke the lease still ends on our side
		let _accepted = c.state.lock().await.waiters.wait("b");
		c.handle("b", Message::lock(LockAction::Accept)).await.unwrap();
		let later = Instant::now() + c.config().lock_lease() + Duration::from_secs(1);
		c.tick_at(later).await.unwrap();
		assert!(!holds(&c, "b").await);
	}
}

// vim: ts=4
