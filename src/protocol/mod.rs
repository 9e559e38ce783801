//! Peer protocol: message envelopes, wire codec and transport seam
//!
//! # Example Usage
//!
//! ```ignore
//! use meshsync::protocol::{Message, Operation};
//!
//! let wire = Message::update(Operation::Modify, object).encode()?;
//! let back = Message::decode(&wire)?;
//! ```

pub mod error;
pub mod memory;
pub mod messages;
pub mod traits;
pub mod types;

pub use error::ProtocolError;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use messages::{
	ChallengeMessage, LockMessage, Message, NotifyMessage, PushMessage, RequestMessage,
	UpdateMessage,
};
pub use traits::{Inbound, ProtocolResult, Transport};
pub use types::{
	ChallengeStage, Communication, LockAction, MsgType, NotifyType, ObjectType, Operation,
};

// vim: ts=4
