//! Protocol error types
//!
//! Errors raised while encoding, decoding or transporting messages.

use std::fmt;
use std::io;

/// Protocol error type
#[derive(Debug)]
pub enum ProtocolError {
	/// I/O error from async operations
	Io(io::Error),
	/// JSON parsing or encoding error
	Json(String),
	/// Base64 decoding error
	Base64(String),
	/// A discriminant string has no entry in its table
	UnknownDiscriminant { kind: &'static str, value: String },
	/// Required field absent
	MissingField(&'static str),
	/// Channel to the peer is gone
	Disconnected(String),
	/// Generic error message
	Other(String),
}

impl fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProtocolError::Io(e) => write!(f, "I/O error: {}", e),
			ProtocolError::Json(msg) => write!(f, "JSON error: {}", msg),
			ProtocolError::Base64(msg) => write!(f, "Base64 decode error: {}", msg),
			ProtocolError::UnknownDiscriminant { kind, value } => {
				write!(f, "Unknown {} discriminant: {:?}", kind, value)
			}
			ProtocolError::MissingField(field) => write!(f, "Missing field: {}", field),
			ProtocolError::Disconnected(peer) => write!(f, "Peer {} disconnected", peer),
			ProtocolError::Other(msg) => write!(f, "{}", msg),
		}
	}
}

impl std::error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
	fn from(e: io::Error) -> Self {
		ProtocolError::Io(e)
	}
}

impl From<String> for ProtocolError {
	fn from(e: String) -> Self {
		ProtocolError::Other(e)
	}
}

impl From<&str> for ProtocolError {
	fn from(e: &str) -> Self {
		ProtocolError::Other(e.to_string())
	}
}

impl From<base64::DecodeError> for ProtocolError {
	fn from(e: base64::DecodeError) -> Self {
		ProtocolError::Base64(e.to_string())
	}
}

impl From<serde_json::Error> for ProtocolError {
	fn from(e: serde_json::Error) -> Self {
		ProtocolError::Json(e.to_string())
	}
}

// vim: ts=4
