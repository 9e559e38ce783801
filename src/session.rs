//! Peer sessions: transport events in, coordinator decisions out
//!
//! One task per peer keeps the events of that peer in order. Different peers
//! are handled concurrently; the coordinator serializes what has to be.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, Outbound};
use crate::error::SyncError;
use crate::protocol::{ChallengeStage, Inbound, Message, Transport};

const SESSION_QUEUE: usize = 64;

/// Deliver everything the coordinator asked for.
///
/// A failed delivery does not stop the others; the last failure is returned.
pub async fn dispatch(transport: &dyn Transport, outbound: Vec<Outbound>) -> Result<(), SyncError> {
	let mut last = Ok(());
	for item in outbound {
		let result = match &item {
			Outbound::Message { to, message } => transport.send(to, message).await,
			Outbound::Transfer { to, identification, object_type, path } => {
				match transport.send(to, &Message::push(identification, *object_type)).await {
					Ok(()) => transport.send_file(to, identification, path).await,
					Err(e) => Err(e),
				}
			}
		};
		if let Err(e) = result {
			warn!("Delivery to {} failed: {}", item.to(), e);
			last = Err(e.into());
		}
	}
	last
}

/// Drive the session with one peer until its queue closes or it fails
/// authentication.
pub async fn run_session(
	coordinator: Arc<Coordinator>,
	transport: Arc<dyn Transport>,
	peer: String,
	mut events: mpsc::Receiver<Inbound>,
) -> Result<(), SyncError> {
	match coordinator.begin_session(&peer).await {
		Ok(outbound) => {
			if let Err(e) = dispatch(transport.as_ref(), outbound).await {
				debug!("Opening of the session with {} not delivered: {}", peer, e);
			}
		}
		Err(e) => warn!("Session with {} starts unauthenticated: {}", peer, e),
	}

	while let Some(event) = events.recv().await {
		let result = match event {
			Inbound::Message { from, message } => coordinator.handle(&from, message).await,
			Inbound::TransferComplete { from, identification } => {
				coordinator.complete_transfer(&from, &identification).await
			}
		};
		match result {
			Ok(outbound) => {
				if let Err(e) = dispatch(transport.as_ref(), outbound).await {
					debug!("Answer to {} not delivered: {}", peer, e);
				}
			}
			Err(e) if e.is_fatal_for_session() => {
				error!("Ending session with {}: {}", peer, e);
				return Err(e);
			}
			Err(e) => warn!("Error handling event from {}: {}", peer, e),
		}
	}
	debug!("Session with {} closed", peer);
	Ok(())
}

/// A fresh challenge is how a peer begins a new session
fn opens_session(event: &Inbound) -> bool {
	matches!(
		event,
		Inbound::Message { message: Message::Challenge(c), .. } if c.stage == ChallengeStage::Challenge
	)
}

struct Router {
	coordinator: Arc<Coordinator>,
	transport: Arc<dyn Transport>,
	sessions: HashMap<String, mpsc::Sender<Inbound>>,
	ended: HashSet<String>,
	opened: HashMap<String, Instant>,
	restart: Duration,
	tasks: JoinSet<Result<(), SyncError>>,
}

impl Router {
	fn open(&mut self, peer: &str) {
		let (tx, rx) = mpsc::channel(SESSION_QUEUE);
		self.sessions.insert(peer.to_string(), tx);
		self.opened.insert(peer.to_string(), Instant::now());
		self.tasks.spawn(run_session(
			self.coordinator.clone(),
			self.transport.clone(),
			peer.to_string(),
			rx,
		));
	}

	/// Hand `event` to the session of its peer; it comes back if that
	/// session has ended.
	async fn deliver(&mut self, peer: &str, event: Inbound) -> Option<Inbound> {
		if self.ended.contains(peer) {
			return Some(event);
		}
		if !self.sessions.contains_key(peer) {
			info!("Opening session with {}", peer);
			self.open(peer);
		}
		let Some(tx) = self.sessions.get(peer) else {
			return Some(event);
		};
		match tx.send(event).await {
			Ok(()) => None,
			Err(mpsc::error::SendError(event)) => {
				self.sessions.remove(peer);
				self.ended.insert(peer.to_string());
				Some(event)
			}
		}
	}

	async fn route(&mut self, event: Inbound) {
		let peer = event.sender().to_string();
		let Some(event) = self.deliver(&peer, event).await else {
			return;
		};
		if !self.may_restart(&peer, &event) {
			debug!("Session with {} has ended, dropping event", peer);
			return;
		}
		info!("{} starts over, opening a new session", peer);
		self.ended.remove(&peer);
		if self.deliver(&peer, event).await.is_some() {
			debug!("New session with {} ended right away", peer);
		}
	}

	/// A peer whose session ended begins a new one with a fresh challenge,
	/// at most once per restart interval.
	fn may_restart(&self, peer: &str, event: &Inbound) -> bool {
		opens_session(event) && self.opened.get(peer).map_or(true, |at| at.elapsed() >= self.restart)
	}
}

/// Serve the local replica until `inbox` closes, then persist the model.
///
/// Sessions are opened for every registered peer up front and lazily for
/// anyone else who writes. A session that ended on a failed challenge is
/// reopened when the peer challenges afresh. The housekeeping tick runs
/// alongside.
pub async fn run(
	coordinator: Arc<Coordinator>,
	transport: Arc<dyn Transport>,
	mut inbox: mpsc::Receiver<Inbound>,
) -> Result<(), SyncError> {
	let mut router = Router {
		coordinator: coordinator.clone(),
		transport: transport.clone(),
		sessions: HashMap::new(),
		ended: HashSet::new(),
		opened: HashMap::new(),
		restart: coordinator.config().session_restart(),
		tasks: JoinSet::new(),
	};
	for peer in coordinator.peer_ids().await {
		router.open(&peer);
	}

	let mut ticker = tokio::time::interval(coordinator.config().tick_interval());
	loop {
		tokio::select! {
			event = inbox.recv() => {
				match event {
					Some(event) => router.route(event).await,
					None => break,
				}
			}
			_ = ticker.tick() => {
				match coordinator.tick().await {
					Ok(outbound) => {
						if let Err(e) = dispatch(transport.as_ref(), outbound).await {
							debug!("Housekeeping messages not delivered: {}", e);
						}
					}
					Err(e) => warn!("Housekeeping failed: {}", e),
				}
			}
		}
	}

	info!("Inbox of {} closed, shutting down", coordinator.self_id());
	router.sessions.clear();
	while let Some(joined) = router.tasks.join_next().await {
		match joined {
			Ok(Ok(())) => {}
			Ok(Err(e)) => debug!("Session ended with {}", e),
			Err(e) => error!("Session task failed: {}", e),
		}
	}
	coordinator.save().await
}


// vim: ts=4
