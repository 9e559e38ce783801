//! Strategy enums shared by configuration and the coordinator
//!
//! Each enum has a FromStr implementation for CLI and config parsing.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// VALIDATION POLICY
// ============================================================================

/// How strictly the self entry of a version vector is compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationPolicy {
	/// Any mismatch of the self counter is a conflict (default)
	#[default]
	Strict,

	/// A higher remote self counter is accepted and adopted locally
	Recover,
}

impl FromStr for ValidationPolicy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"strict" => Ok(Self::Strict),
			"recover" | "recovery" => Ok(Self::Recover),
			_ => Err(format!("Unknown validation policy: {}. Valid options: strict, recover", s)),
		}
	}
}

impl std::fmt::Display for ValidationPolicy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Strict => write!(f, "strict"),
			Self::Recover => write!(f, "recover"),
		}
	}
}

// ============================================================================
// CONFLICT RESOLUTION
// ============================================================================

/// Which side of a conflict pair survives a manual resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
	/// Keep the local content
	KeepLocal,

	/// Keep the content received from the remote peer
	KeepRemote,
}

impl FromStr for Resolution {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"keep-local" | "local" | "mine" => Ok(Self::KeepLocal),
			"keep-remote" | "remote" | "theirs" => Ok(Self::KeepRemote),
			_ => Err(format!("Unknown resolution: {}. Valid options: keep-local, keep-remote", s)),
		}
	}
}

impl std::fmt::Display for Resolution {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::KeepLocal => write!(f, "keep-local"),
			Self::KeepRemote => write!(f, "keep-remote"),
		}
	}
}


// vim: ts=4
