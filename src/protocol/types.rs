//! Wire discriminants
//!
//! Every enum that travels on the wire or lands in a persisted record is
//! encoded as a lowercase string token through an explicit table, so that
//! reordering variants never changes the wire form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::error::ProtocolError;

macro_rules! wire_enum {
	(
		$(#[$meta:meta])*
		pub enum $name:ident as $kind:literal {
			$( $(#[$vmeta:meta])* $variant:ident => $token:literal, )+
		}
	) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum $name {
			$( $(#[$vmeta])* $variant, )+
		}

		impl $name {
			/// Every variant, in declaration order
			pub const ALL: &'static [$name] = &[$($name::$variant),+];

			/// The wire token
			pub fn as_str(&self) -> &'static str {
				match self {
					$( $name::$variant => $token, )+
				}
			}
		}

		impl FromStr for $name {
			type Err = ProtocolError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				match s {
					$( $token => Ok($name::$variant), )+
					_ => Err(ProtocolError::UnknownDiscriminant {
						kind: $kind,
						value: s.to_string(),
					}),
				}
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(self.as_str())
			}
		}

		impl Serialize for $name {
			fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
				serializer.serialize_str(self.as_str())
			}
		}

		impl<'de> Deserialize<'de> for $name {
			fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
				let token = String::deserialize(deserializer)?;
				token.parse().map_err(serde::de::Error::custom)
			}
		}
	};
}

wire_enum! {
	/// Message discriminant
	pub enum MsgType as "message type" {
		Update => "update",
		Request => "request",
		Notify => "notify",
		Lock => "lock",
		Push => "push",
		Challenge => "challenge",
	}
}

wire_enum! {
	/// What an update did to the object
	pub enum Operation as "operation" {
		Create => "create",
		Modify => "modify",
		Remove => "remove",
	}
}

wire_enum! {
	/// Kind of entity a request or push refers to
	pub enum ObjectType as "object type" {
		None => "none",
		Object => "object",
		Model => "model",
		Peer => "peer",
	}
}

wire_enum! {
	/// Lock protocol actions
	pub enum LockAction as "lock action" {
		Request => "request",
		Release => "release",
		Accept => "accept",
	}
}

wire_enum! {
	/// Terminal states announced by notify messages
	pub enum NotifyType as "notify type" {
		/// Removal has been carried out locally
		Removed => "removed",
		/// The identifier is not known here
		Missing => "missing",
	}
}

wire_enum! {
	/// Step of the challenge exchange
	pub enum ChallengeStage as "challenge stage" {
		Challenge => "challenge",
		Response => "response",
	}
}

wire_enum! {
	/// Communication method of a peer
	pub enum Communication as "communication" {
		None => "none",
		Tox => "tox",
	}
}


// vim: ts=4
