//! Error types for meshsync operations

use std::error::Error;
use std::fmt;
use std::io;

use crate::protocol::ProtocolError;

/// Main error type for the sync core
#[derive(Debug)]
pub enum SyncError {
	/// Operation referenced an object with no local record
	NotTracked { identification: String },

	/// Version validation rejected an update
	Conflict { identification: String },

	/// Tracked metadata is internally inconsistent
	IllegalState { message: String },

	/// Requested action has no handler in the current mode
	Unsupported { what: String },

	/// Peer must authenticate before its messages are acted upon
	Unauthenticated { peer: String },

	/// Challenge response did not match; fatal for the peer session
	AuthenticationFailed { peer: String },

	/// Peer is not present in the registry
	UnknownPeer { peer: String },

	/// A round trip did not complete in time
	Timeout { what: String },

	/// Received content does not match the announced fingerprint
	HashMismatch { expected: String, actual: String },

	/// Path is not a synchronized root
	NotSyncRoot { path: String },

	/// Invalid configuration
	InvalidConfig { message: String },

	/// Persisted state could not be (de)serialized
	Serialization { message: String },

	/// Transport collaborator failed
	Transport { message: String },

	/// I/O error
	Io(io::Error),

	/// Protocol error (nested)
	Protocol(ProtocolError),

	/// Generic error message
	Other { message: String },
}

impl SyncError {
	/// Whether the error ends the session with the peer that caused it
	pub fn is_fatal_for_session(&self) -> bool {
		matches!(self, SyncError::AuthenticationFailed { .. })
	}

	pub(crate) fn illegal(message: impl Into<String>) -> Self {
		SyncError::IllegalState { message: message.into() }
	}

	pub(crate) fn not_tracked(identification: &str) -> Self {
		SyncError::NotTracked { identification: identification.to_string() }
	}
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::NotTracked { identification } => {
				write!(f, "Object is not tracked in the model: {}", identification)
			}
			SyncError::Conflict { identification } => {
				write!(f, "Conflict, can not apply update for {}", identification)
			}
			SyncError::IllegalState { message } => write!(f, "Illegal state: {}", message),
			SyncError::Unsupported { what } => write!(f, "Unsupported: {}", what),
			SyncError::Unauthenticated { peer } => {
				write!(f, "Peer {} has not authenticated", peer)
			}
			SyncError::AuthenticationFailed { peer } => {
				write!(f, "Authentication of peer {} failed", peer)
			}
			SyncError::UnknownPeer { peer } => write!(f, "Unknown peer: {}", peer),
			SyncError::Timeout { what } => write!(f, "Timeout while waiting for {}", what),
			SyncError::HashMismatch { expected, actual } => {
				write!(f, "Hash mismatch: expected {}, got {}", expected, actual)
			}
			SyncError::NotSyncRoot { path } => {
				write!(f, "Path is not a synchronized directory: {}", path)
			}
			SyncError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			SyncError::Serialization { message } => {
				write!(f, "Serialization error: {}", message)
			}
			SyncError::Transport { message } => write!(f, "Transport error: {}", message),
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::Protocol(e) => write!(f, "Protocol error: {}", e),
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {
	fn source(&self) -> Option<&(dyn Error + 'static)> {
		match self {
			SyncError::Io(e) => Some(e),
			SyncError::Protocol(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<ProtocolError> for SyncError {
	fn from(e: ProtocolError) -> Self {
		SyncError::Protocol(e)
	}
}

impl From<serde_json::Error> for SyncError {
	fn from(e: serde_json::Error) -> Self {
		SyncError::Serialization { message: e.to_string() }
	}
}

impl From<json5::Error> for SyncError {
	fn from(e: json5::Error) -> Self {
		SyncError::Serialization { message: e.to_string() }
	}
}

impl From<String> for SyncError {
	fn from(e: String) -> Self {
		SyncError::Other { message: e }
	}
}


// vim: ts=4
