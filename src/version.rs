//! Version vectors for per-object causality tracking
//!
//! Every tracked object carries a [`VersionVector`] mapping peer identifiers to
//! edit counters. Comparing the local vector against an incoming one decides
//! whether a remote update can be applied or whether both replicas progressed
//! independently and the update is a conflict.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::strategies::ValidationPolicy;

/// A vector clock: peer identifier to edit counter
///
/// A missing key means no known edits from that peer, which is not the same as
/// a present zero entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector {
	entries: BTreeMap<String, i64>,
}

/// Outcome of comparing a local vector against a remote one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
	/// Remote is causally equal or newer, apply it
	Valid,

	/// Valid, but the local self entry must first be advanced to this counter
	AdvanceSelf(i64),

	/// Replicas diverged
	Invalid(Rejection),
}

impl Validation {
	pub fn is_valid(&self) -> bool {
		!matches!(self, Validation::Invalid(_))
	}
}

/// Why a remote vector was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
	/// The self entries disagree
	SelfMismatch { local: Option<i64>, remote: Option<i64> },

	/// The remote does not know about edits from this peer at all
	MissingPeer { peer: String },

	/// The remote knows fewer edits from this peer than we do
	Behind { peer: String, local: i64, remote: i64 },
}

impl fmt::Display for Rejection {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Rejection::SelfMismatch { local, remote } => {
				write!(f, "self entry mismatch (local {:?}, remote {:?})", local, remote)
			}
			Rejection::MissingPeer { peer } => write!(f, "missing update from <{}>", peer),
			Rejection::Behind { peer, local, remote } => {
				write!(f, "missing updates from <{}> ({} > {})", peer, local, remote)
			}
		}
	}
}

impl VersionVector {
	pub fn new() -> Self {
		Self::default()
	}

	/// Counter for a peer, if it ever edited
	pub fn get(&self, peer: &str) -> Option<i64> {
		self.entries.get(peer).copied()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
		self.entries.iter().map(|(k, v)| (k.as_str(), *v))
	}

	/// Record a locally originated change.
	///
	/// The counter is set to `max() + 1` so it is higher than every edit this
	/// replica has seen, not only its own.
	pub fn increase(&mut self, peer: &str) {
		let next = self.max().saturating_add(1);
		self.entries.insert(peer.to_string(), next);
	}

	/// Greatest counter over all entries, 0 if empty.
	pub fn max(&self) -> i64 {
		self.entries.values().copied().fold(0, i64::max)
	}

	/// True if every entry of `other` is known here with an equal or higher counter.
	pub fn includes(&self, other: &VersionVector) -> bool {
		other.entries.iter().all(|(peer, value)| match self.entries.get(peer) {
			Some(local) => local >= value,
			None => false,
		})
	}

	/// Merge a vector whose peers are disjoint from ours.
	///
	/// Returns false and leaves `self` untouched if any peer appears in both.
	pub fn merge(&mut self, other: &VersionVector) -> bool {
		if other.entries.keys().any(|peer| self.entries.contains_key(peer)) {
			return false;
		}
		for (peer, value) in &other.entries {
			self.entries.insert(peer.clone(), *value);
		}
		true
	}

	/// Point-wise maximum of both vectors.
	pub fn join(&mut self, other: &VersionVector) {
		for (peer, value) in &other.entries {
			let entry = self.entries.entry(peer.clone()).or_insert(*value);
			if *value > *entry {
				*entry = *value;
			}
		}
	}

	/// Raise the counter of `peer` to `value`; never lowers it.
	pub(crate) fn advance(&mut self, peer: &str, value: i64) {
		let entry = self.entries.entry(peer.to_string()).or_insert(value);
		if value > *entry {
			*entry = value;
		}
	}

	/// Strict validity check of `that` replacing `self`.
	pub fn valid(&self, that: &VersionVector, self_id: &str) -> bool {
		self.validate(that, self_id, ValidationPolicy::Strict).is_valid()
	}

	/// Decide whether `that` may replace `self` without losing edits.
	///
	/// A local self entry the remote does not carry is a local edit the
	/// remote never saw, so it is rejected under either policy. Both sides of
	/// a concurrent edit then see the conflict.
	pub fn validate(
		&self,
		that: &VersionVector,
		self_id: &str,
		policy: ValidationPolicy,
	) -> Validation {
		let local_self = self.get(self_id);
		let remote_self = that.get(self_id);
		let mut advance = None;

		match (local_self, remote_self) {
			(None, None) => {}
			(Some(l), Some(r)) if l == r => {}
			(l, Some(r)) if policy == ValidationPolicy::Recover && l.map_or(true, |l| r > l) => {
				warn!(
					"Version: remote knows newer edits of self <{}> than we do ({:?} < {}), advancing",
					self_id, l, r
				);
				advance = Some(r);
			}
			(local, remote) => {
				debug!("Version: wrong value for self <{}>! {} {}", self_id, self, that);
				return Validation::Invalid(Rejection::SelfMismatch { local, remote });
			}
		}

		for (peer, local_value) in &self.entries {
			if peer == self_id {
				continue;
			}
			let Some(remote_value) = that.entries.get(peer) else {
				debug!("Version: missing update from <{}>! {} {}", peer, self, that);
				return Validation::Invalid(Rejection::MissingPeer { peer: peer.clone() });
			};
			if local_value > remote_value {
				debug!("Version: missing updates from <{}>! {} {}", peer, self, that);
				return Validation::Invalid(Rejection::Behind {
					peer: peer.clone(),
					local: *local_value,
					remote: *remote_value,
				});
			}
		}

		match advance {
			Some(value) => Validation::AdvanceSelf(value),
			None => Validation::Valid,
		}
	}
}

impl fmt::Display for VersionVector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let values: Vec<String> =
			self.entries.iter().map(|(peer, value)| format!("[{}:{}]", peer, value)).collect();
		write!(f, "Version{{{}}}", values.join(","))
	}
}

impl<S: Into<String>> FromIterator<(S, i64)> for VersionVector {
	fn from_iter<I: IntoIterator<Item = (S, i64)>>(iter: I) -> Self {
		VersionVector { entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect() }
	}
}


// vim: ts=4
