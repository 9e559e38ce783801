//! Protocol messages exchanged between peers
//!
//! A [`Message`] is an immutable tagged envelope. On the wire it is a JSON
//! object whose `"type"` field names the variant; every other discriminant is a
//! lowercase token as well. Decoding goes through the explicit token tables so
//! that an unknown discriminant is reported as
//! [`ProtocolError::UnknownDiscriminant`] instead of silently defaulting.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

use super::error::ProtocolError;
use super::types::*;
use crate::object::ObjectInfo;

/// Announces a change of one object
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
	pub operation: Operation,
	pub object: ObjectInfo,
}

/// Asks the receiver to transfer an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMessage {
	pub object_type: ObjectType,
	pub identification: String,
}

/// Announces a terminal state of an identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyMessage {
	pub notify: NotifyType,
	pub identification: String,
}

/// One step of the lock protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMessage {
	pub action: LockAction,
}

/// Announces an incoming transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
	pub identification: String,
	pub object_type: ObjectType,
}

/// Challenge or response of the authentication exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
	pub stage: ChallengeStage,
	payload: Vec<u8>,
}

impl ChallengeMessage {
	pub fn new(stage: ChallengeStage, payload: Vec<u8>) -> Self {
		ChallengeMessage { stage, payload }
	}

	/// Opaque challenge or response bytes
	pub fn payload(&self) -> &[u8] {
		&self.payload
	}
}

/// Protocol envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
	Update(UpdateMessage),
	Request(RequestMessage),
	Notify(NotifyMessage),
	Lock(LockMessage),
	Push(PushMessage),
	Challenge(ChallengeMessage),
}

impl Message {
	pub fn update(operation: Operation, object: ObjectInfo) -> Self {
		Message::Update(UpdateMessage { operation, object })
	}

	pub fn request(object_type: ObjectType, identification: &str) -> Self {
		Message::Request(RequestMessage { object_type, identification: identification.to_string() })
	}

	pub fn notify(notify: NotifyType, identification: &str) -> Self {
		Message::Notify(NotifyMessage { notify, identification: identification.to_string() })
	}

	pub fn lock(action: LockAction) -> Self {
		Message::Lock(LockMessage { action })
	}

	pub fn push(identification: &str, object_type: ObjectType) -> Self {
		Message::Push(PushMessage { identification: identification.to_string(), object_type })
	}

	pub fn challenge(stage: ChallengeStage, payload: Vec<u8>) -> Self {
		Message::Challenge(ChallengeMessage::new(stage, payload))
	}

	pub fn msg_type(&self) -> MsgType {
		match self {
			Message::Update(_) => MsgType::Update,
			Message::Request(_) => MsgType::Request,
			Message::Notify(_) => MsgType::Notify,
			Message::Lock(_) => MsgType::Lock,
			Message::Push(_) => MsgType::Push,
			Message::Challenge(_) => MsgType::Challenge,
		}
	}

	/// Wire form
	pub fn encode(&self) -> Result<String, ProtocolError> {
		let body = match self {
			Message::Update(m) => json!({
				"operation": m.operation.as_str(),
				"object": serde_json::to_value(&m.object)?,
			}),
			Message::Request(m) => json!({
				"objectType": m.object_type.as_str(),
				"identification": m.identification,
			}),
			Message::Notify(m) => json!({
				"notify": m.notify.as_str(),
				"identification": m.identification,
			}),
			Message::Lock(m) => json!({ "action": m.action.as_str() }),
			Message::Push(m) => json!({
				"identification": m.identification,
				"objectType": m.object_type.as_str(),
			}),
			Message::Challenge(m) => json!({
				"stage": m.stage.as_str(),
				"payload": BASE64.encode(&m.payload),
			}),
		};
		let mut envelope = Map::new();
		envelope.insert("type".to_string(), Value::from(self.msg_type().as_str()));
		if let Value::Object(fields) = body {
			envelope.extend(fields);
		}
		Ok(serde_json::to_string(&Value::Object(envelope))?)
	}

	/// Parse the wire form
	pub fn decode(data: &str) -> Result<Message, ProtocolError> {
		let mut value: Value = serde_json::from_str(data)?;
		let msg_type: MsgType = token(&value, "type")?;
		let message = match msg_type {
			MsgType::Update => {
				let operation = token(&value, "operation")?;
				let object = value
					.get_mut("object")
					.map(Value::take)
					.ok_or(ProtocolError::MissingField("object"))?;
				Message::Update(UpdateMessage { operation, object: serde_json::from_value(object)? })
			}
			MsgType::Request => Message::Request(RequestMessage {
				object_type: token(&value, "objectType")?,
				identification: text(&value, "identification")?,
			}),
			MsgType::Notify => Message::Notify(NotifyMessage {
				notify: token(&value, "notify")?,
				identification: text(&value, "identification")?,
			}),
			MsgType::Lock => Message::Lock(LockMessage { action: token(&value, "action")? }),
			MsgType::Push => Message::Push(PushMessage {
				identification: text(&value, "identification")?,
				object_type: token(&value, "objectType")?,
			}),
			MsgType::Challenge => Message::Challenge(ChallengeMessage {
				stage: token(&value, "stage")?,
				payload: BASE64.decode(text(&value, "payload")?)?,
			}),
		};
		Ok(message)
	}
}

fn text(value: &Value, field: &'static str) -> Result<String, ProtocolError> {
	value
		.get(field)
		.and_then(Value::as_str)
		.map(str::to_string)
		.ok_or(ProtocolError::MissingField(field))
}

fn token<T>(value: &Value, field: &'static str) -> Result<T, ProtocolError>
where
	T: FromStr<Err = ProtocolError>,
{
	match value.get(field) {
		Some(Value::String(s)) => s.parse(),
		Some(other) => Err(ProtocolError::UnknownDiscriminant {
			kind: field,
			value: other.to_string(),
		}),
		None => Err(ProtocolError::MissingField(field)),
	}
}

impl fmt::Display for Message {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Message::Update(m) => write!(
				f,
				"UpdateMessage{{Operation:{},Object:{},Version:{}}}",
				m.operation, m.object.identification, m.object.version
			),
			Message::Request(m) => write!(
				f,
				"RequestMessage{{ObjType:{},Identification:{}}}",
				m.object_type, m.identification
			),
			Message::Notify(m) => write!(
				f,
				"NotifyMessage{{Notify:{},Identification:{}}}",
				m.notify, m.identification
			),
			Message::Lock(m) => write!(f, "LockMessage{{Action:{}}}", m.action),
			Message::Push(m) => write!(
				f,
				"PushMessage{{Identification:{},ObjType:{}}}",
				m.identification, m.object_type
			),
			Message::Challenge(m) => {
				write!(f, "ChallengeMessage{{Stage:{},Bytes:{}}}", m.stage, m.payload.len())
			}
		}
	}
}


// vim: ts=4
