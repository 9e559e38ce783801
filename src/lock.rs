//! Lock coordination between peers
//!
//! The granting side keeps a [`LockTable`]: one holder at a time, everyone
//! else waits in arrival order. Grants carry a lease so that a holder that
//! disappears does not block the queue forever.
//!
//! The requesting side keeps [`LockWaiters`]: a requester must not proceed
//! before it has observed the counterpart's accept, and stops believing it
//! holds a lock once the lease is over or the granter revoked it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
	pub peer: String,
	pub granted_at: Instant,
}

/// Outcome of a lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
	/// Lock granted now, answer with accept
	Granted,

	/// Requester already holds the lock, answer with accept again
	AlreadyHeld,

	/// Lock is held by someone else, requester waits in the queue
	Queued,
}

/// Outcome of a lock release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRelease {
	/// Released; the next waiter (if any) now holds the lock
	Released { next: Option<String> },

	/// Requester withdrew from the queue before it was granted
	Withdrawn,

	/// Sender holds nothing here, nothing changes
	NotHolder,
}

#[derive(Debug, Default)]
pub struct LockTable {
	holder: Option<Grant>,
	queue: VecDeque<String>,
}

impl LockTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn holder(&self) -> Option<&Grant> {
		self.holder.as_ref()
	}

	pub fn waiting(&self) -> impl Iterator<Item = &str> {
		self.queue.iter().map(String::as_str)
	}

	pub fn request(&mut self, peer: &str, now: Instant) -> LockDecision {
		match &self.holder {
			Some(grant) if grant.peer == peer => LockDecision::AlreadyHeld,
			Some(grant) => {
				if !self.queue.iter().any(|p| p == peer) {
					debug!("Lock held by {}, queueing {}", grant.peer, peer);
					self.queue.push_back(peer.to_string());
				}
				LockDecision::Queued
			}
			None => {
				info!("Lock granted to {}", peer);
				self.holder = Some(Grant { peer: peer.to_string(), granted_at: now });
				LockDecision::Granted
			}
		}
	}

	pub fn release(&mut self, peer: &str, now: Instant) -> LockRelease {
		match &self.holder {
			Some(grant) if grant.peer == peer => {
				info!("Lock released by {}", peer);
				LockRelease::Released { next: self.grant_next(now) }
			}
			_ => {
				let before = self.queue.len();
				self.queue.retain(|p| p != peer);
				if before != self.queue.len() {
					debug!("{} withdrew its lock request", peer);
					LockRelease::Withdrawn
				} else {
					debug!("Ignoring release from {}: not the holder", peer);
					LockRelease::NotHolder
				}
			}
		}
	}

	/// Expire a grant older than `lease`; returns the expired holder and the
	/// newly granted peer.
	pub fn expire(&mut self, lease: Duration, now: Instant) -> Option<(String, Option<String>)> {
		let grant = self.holder.as_ref()?;
		if now.saturating_duration_since(grant.granted_at) < lease {
			return None;
		}
		let expired = grant.peer.clone();
		warn!("Lock lease of {} expired", expired);
		let next = self.grant_next(now);
		Some((expired, next))
	}

	fn grant_next(&mut self, now: Instant) -> Option<String> {
		self.holder = None;
		let next = self.queue.pop_front()?;
		info!("Lock granted to {}", next);
		self.holder = Some(Grant { peer: next.clone(), granted_at: now });
		Some(next)
	}
}

/// Requester side: pending requests and locks held at counterparts
#[derive(Debug, Default)]
pub struct LockWaiters {
	pending: HashMap<String, oneshot::Sender<()>>,
	held: HashMap<String, Instant>,
}

impl LockWaiters {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register interest in the lock of `peer`
	pub fn wait(&mut self, peer: &str) -> oneshot::Receiver<()> {
		let (tx, rx) = oneshot::channel();
		if self.pending.insert(peer.to_string(), tx).is_some() {
			debug!("Replacing earlier lock wait on {}", peer);
		}
		rx
	}

	/// An accept arrived; returns false if nobody was waiting for it
	pub fn accept(&mut self, peer: &str, now: Instant) -> bool {
		match self.pending.remove(peer) {
			Some(tx) => {
				if tx.send(()).is_err() {
					// requester already gave up
					return false;
				}
				self.held.insert(peer.to_string(), now);
				true
			}
			None => self.held.contains_key(peer),
		}
	}

	pub fn cancel(&mut self, peer: &str) {
		self.pending.remove(peer);
	}

	/// Whether the lock of `peer` is held and its lease is not over
	pub fn holds(&self, peer: &str, lease: Duration, now: Instant) -> bool {
		self.held
			.get(peer)
			.is_some_and(|since| now.saturating_duration_since(*since) < lease)
	}

	/// Forget the lock of `peer`; false if it was not held
	pub fn release(&mut self, peer: &str) -> bool {
		self.held.remove(peer).is_some()
	}

	/// Drop locks whose lease is over; returns their granters
	pub fn expire(&mut self, lease: Duration, now: Instant) -> Vec<String> {
		let expired: Vec<String> = self
			.held
			.iter()
			.filter(|(_, since)| now.saturating_duration_since(**since) >= lease)
			.map(|(peer, _)| peer.clone())
			.collect();
		for peer in &expired {
			warn!("Lease of the lock at {} is over", peer);
			self.held.remove(peer);
		}
		expired
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fifo_grant() {
		let now = Instant::now();
		let mut table = LockTable::new();
		assert_eq!(table.request("a", now), LockDecision::Granted);
		assert_eq!(table.request("b", now), LockDecision::Queued);
		assert_eq!(table.request("c", now), LockDecision::Queued);
		assert_eq!(table.request("b", now), LockDecision::Queued);
		assert_eq!(table.waiting().collect::<Vec<_>>(), vec!["b", "c"]);

		assert_eq!(table.release("a", now), LockRelease::Released { next: Some("b".into()) });
		assert_eq!(table.holder().unwrap().peer, "b");
		assert_eq!(table.release("b", now), LockRelease::Released { next: Some("c".into()) });
		assert_eq!(table.release("c", now), LockRelease::Released { next: None });
		assert!(table.holder().is_none());
	}

	#[test]
	fn test_only_holder_releases() {
		let now = Instant::now();
		let mut table = LockTable::new();
		table.request("a", now);
		assert_eq!(table.release("x", now), LockRelease::NotHolder);
		assert_eq!(table.holder().unwrap().peer, "a");
	}

	#[test]
	fn test_duplicate_request_is_harmless() {
		let now = Instant::now();
		let mut table = LockTable::new();
		table.request("a", now);
		assert_eq!(table.request("a", now), LockDecision::AlreadyHeld);
		assert_eq!(table.waiting().count(), 0);
	}

	#[test]
	fn test_withdraw_from_queue() {
		let now = Instant::now();
		let mut table = LockTable::new();
		table.request("a", now);
		table.request("b", now);
		assert_eq!(table.release("b", now), LockRelease::Withdrawn);
		assert_eq!(table.release("a", now), LockRelease::Released { next: None });
	}

	#[test]
	fn test_lease_expiry() {
		let now = Instant::now();
		let mut table = LockTable::new();
		table.request("a", now);
		table.request("b", now);
		let lease = Duration::from_secs(30);
		assert!(table.expire(lease, now + Duration::from_secs(10)).is_none());
		let (expired, next) = table.expire(lease, now + Duration::from_secs(31)).unwrap();
		assert_eq!(expired, "a");
		assert_eq!(next.as_deref(), Some("b"));
		assert_eq!(table.holder().unwrap().peer, "b");
	}

	const LEASE: Duration = Duration::from_secs(30);

	#[tokio::test]
	async fn test_waiters() {
		let now = Instant::now();
		let mut waiters = LockWaiters::new();
		let rx = waiters.wait("a");
		assert!(waiters.accept("a", now));
		rx.await.unwrap();
		assert!(waiters.holds("a", LEASE, now));
		assert!(waiters.release("a"));
		assert!(!waiters.accept("b", now));
	}

	#[tokio::test]
	async fn test_abandoned_wait() {
		let now = Instant::now();
		let mut waiters = LockWaiters::new();
		drop(waiters.wait("a"));
		assert!(!waiters.accept("a", now));
		assert!(!waiters.holds("a", LEASE, now));
	}

	#[tokio::test]
	async fn test_held_lock_ends_with_its_lease() {
		let now = Instant::now();
		let mut waiters = LockWaiters::new();
		let _rx = waiters.wait("a");
		waiters.accept("a", now);
		let later = now + LEASE + Duration::from_secs(1);
		assert!(waiters.holds("a", LEASE, now + Duration::from_secs(10)));
		assert!(!waiters.holds("a", LEASE, later));
		assert!(waiters.expire(LEASE, now).is_empty());
		assert_eq!(waiters.expire(LEASE, later), vec!["a".to_string()]);
		assert!(!waiters.release("a"));
	}
}

// vim: ts=4
