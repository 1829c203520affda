#![forbid(unsafe_code)]

use std::time::SystemTime;

use serde::Deserialize;
use streamhub_domain::{Event, EventMetadata, EventType, Payload, PlatformId};
use streamhub_util::time::unix_ms;
use thiserror::Error;

/// Classification of a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
	/// Session handshake.
	Welcome,
	Keepalive,
	/// Server asks the client to move to another URL.
	Reconnect,
	/// A subscription was revoked by the platform.
	Revocation,
	Notification,
	Other(String),
}

impl MessageKind {
	/// Whether this frame proves the stream is alive.
	pub fn is_heartbeat(&self) -> bool {
		matches!(self, Self::Welcome | Self::Keepalive)
	}

	fn from_wire(s: &str) -> Self {
		match s {
			"session_welcome" => Self::Welcome,
			"session_keepalive" => Self::Keepalive,
			"session_reconnect" => Self::Reconnect,
			"revocation" => Self::Revocation,
			"notification" => Self::Notification,
			other => Self::Other(other.to_string()),
		}
	}
}

/// Generic decoded frame.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
	pub kind: MessageKind,
	pub message_id: Option<String>,
	pub timestamp: Option<SystemTime>,
	pub subscription_type: Option<String>,
	/// Structured frame body (`payload` object of the frame).
	pub payload: serde_json::Value,
}

impl DecodedMessage {
	pub fn new(kind: MessageKind, payload: serde_json::Value) -> Self {
		Self {
			kind,
			message_id: None,
			timestamp: None,
			subscription_type: None,
			payload,
		}
	}
}

#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("frame is not valid utf-8")]
	Utf8(#[from] std::str::Utf8Error),
	#[error("frame is not valid json: {0}")]
	Json(#[from] serde_json::Error),
	#[error("frame is missing {0}")]
	Missing(&'static str),
}

/// Protocol-specific frame decoder.
pub trait MessageDecoder: Send + Sync + 'static {
	/// Decode one raw frame.
	fn decode(&self, raw: &[u8]) -> Result<DecodedMessage, DecodeError>;

	/// Map a decoded frame into an internal event, if it carries one.
	fn to_event(&self, platform: &PlatformId, msg: &DecodedMessage) -> Option<Event>;
}

#[derive(Debug, Deserialize)]
struct FrameMetadata {
	#[serde(default)]
	message_id: Option<String>,
	message_type: String,
	#[serde(default)]
	message_timestamp: Option<String>,
	#[serde(default)]
	subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Frame {
	metadata: FrameMetadata,
	#[serde(default)]
	payload: serde_json::Value,
}

/// Decoder for EventSub-style websocket frames (`metadata` + `payload`).
#[derive(Debug, Clone, Copy, Default)]
pub struct EventSubDecoder;

impl EventSubDecoder {
	pub fn new() -> Self {
		Self
	}

	/// Internal event type for a notification subscription type.
	pub fn event_type_for(subscription_type: &str) -> EventType {
		match subscription_type {
			"channel.chat.message" => EventType::ChatMessage,
			"channel.subscribe" | "channel.subscription.gift" | "channel.subscription.message" => EventType::Subscription,
			"channel.follow" => EventType::Follow,
			"channel.raid" => EventType::Raid,
			"channel.cheer" => EventType::Bits,
			"channel.channel_points_custom_reward_redemption.add" => EventType::ChannelPointRedemption,
			_ => EventType::Unknown,
		}
	}
}

impl MessageDecoder for EventSubDecoder {
	fn decode(&self, raw: &[u8]) -> Result<DecodedMessage, DecodeError> {
		let text = std::str::from_utf8(raw)?;
		let frame: Frame = serde_json::from_str(text)?;
		if frame.metadata.message_type.trim().is_empty() {
			return Err(DecodeError::Missing("metadata.message_type"));
		}

		let timestamp = frame
			.metadata
			.message_timestamp
			.as_deref()
			.and_then(|ts| parse_message_timestamp(ts).ok());

		Ok(DecodedMessage {
			kind: MessageKind::from_wire(&frame.metadata.message_type),
			message_id: frame.metadata.message_id,
			timestamp,
			subscription_type: frame.metadata.subscription_type,
			payload: frame.payload,
		})
	}

	fn to_event(&self, platform: &PlatformId, msg: &DecodedMessage) -> Option<Event> {
		if msg.kind != MessageKind::Notification {
			return None;
		}

		let subscription_type = msg
			.subscription_type
			.as_deref()
			.or_else(|| msg.payload.pointer("/subscription/type").and_then(|v| v.as_str()))?;

		let event = msg.payload.get("event")?.as_object()?;

		let mut payload: Payload = event.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
		payload.insert("subscription_type".to_string(), subscription_type.into());
		if let Some(ts) = msg.timestamp {
			payload.insert("platform_time_ms".to_string(), unix_ms(ts).into());
		}

		let str_field = |keys: &[&str]| -> Option<String> {
			keys.iter()
				.find_map(|k| event.get(*k).and_then(|v| v.as_str()))
				.map(str::to_string)
		};

		let mut metadata = EventMetadata::default();
		metadata.viewer_id = str_field(&["chatter_user_id", "user_id", "from_broadcaster_user_id"]);
		metadata.channel_id = str_field(&["broadcaster_user_id", "to_broadcaster_user_id"]);
		if let Some(id) = &msg.message_id {
			metadata.correlation_id = id.clone();
		}

		Some(Event::new(Self::event_type_for(subscription_type), platform.clone(), payload).with_metadata(metadata))
	}
}

/// Convert a `metadata.message_timestamp` RFC3339 timestamp into `SystemTime`.
///
/// EventSub timestamps are RFC3339 with fractional seconds and Zulu (UTC).
pub fn parse_message_timestamp(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts)?;
	Ok(SystemTime::from(dt.with_timezone(&chrono::Utc)))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn platform() -> PlatformId {
		PlatformId::new("twitch").unwrap()
	}

	#[test]
	fn classifies_keepalive_and_welcome_as_heartbeats() {
		let dec = EventSubDecoder::new();
		let keepalive = br#"{"metadata":{"message_id":"m1","message_type":"session_keepalive","message_timestamp":"2023-07-19T10:11:12.634234626Z"},"payload":{}}"#;
		let welcome = br#"{"metadata":{"message_id":"m0","message_type":"session_welcome"},"payload":{"session":{"id":"s1","keepalive_timeout_seconds":10}}}"#;

		let k = dec.decode(keepalive).unwrap();
		assert_eq!(k.kind, MessageKind::Keepalive);
		assert!(k.kind.is_heartbeat());
		assert!(k.timestamp.is_some());

		let w = dec.decode(welcome).unwrap();
		assert_eq!(w.kind, MessageKind::Welcome);
		assert_eq!(w.payload.pointer("/session/id").and_then(|v| v.as_str()), Some("s1"));
	}

	#[test]
	fn notification_maps_to_chat_event() {
		let dec = EventSubDecoder::new();
		let raw = br#"{
			"metadata": {
				"message_id": "msg-1",
				"message_type": "notification",
				"message_timestamp": "2023-07-19T10:11:12.634234626Z",
				"subscription_type": "channel.chat.message"
			},
			"payload": {
				"subscription": {"id": "sub-1", "type": "channel.chat.message"},
				"event": {
					"broadcaster_user_id": "1971641",
					"chatter_user_id": "4145994",
					"chatter_user_login": "viewer32",
					"message": {"text": "hi chat"}
				}
			}
		}"#;

		let msg = dec.decode(raw).unwrap();
		assert!(!msg.kind.is_heartbeat());

		let ev = dec.to_event(&platform(), &msg).expect("notification maps to an event");
		assert_eq!(ev.kind, EventType::ChatMessage);
		assert_eq!(ev.platform, platform());
		assert_eq!(ev.payload_str("chatter_user_login"), Some("viewer32"));
		assert_eq!(ev.payload_str("subscription_type"), Some("channel.chat.message"));

		let meta = ev.metadata.as_ref().unwrap();
		assert_eq!(meta.viewer_id.as_deref(), Some("4145994"));
		assert_eq!(meta.channel_id.as_deref(), Some("1971641"));
		assert_eq!(meta.correlation_id, "msg-1");
	}

	#[test]
	fn subscription_types_map_to_event_types() {
		assert_eq!(EventSubDecoder::event_type_for("channel.raid"), EventType::Raid);
		assert_eq!(EventSubDecoder::event_type_for("channel.cheer"), EventType::Bits);
		assert_eq!(EventSubDecoder::event_type_for("channel.follow"), EventType::Follow);
		assert_eq!(EventSubDecoder::event_type_for("channel.subscribe"), EventType::Subscription);
		assert_eq!(
			EventSubDecoder::event_type_for("channel.channel_points_custom_reward_redemption.add"),
			EventType::ChannelPointRedemption
		);
		assert_eq!(EventSubDecoder::event_type_for("channel.poll.begin"), EventType::Unknown);
	}

	#[test]
	fn non_notifications_do_not_map() {
		let dec = EventSubDecoder::new();
		let msg = DecodedMessage::new(MessageKind::Keepalive, serde_json::json!({}));
		assert!(dec.to_event(&platform(), &msg).is_none());
	}

	#[test]
	fn garbage_is_a_decode_error() {
		let dec = EventSubDecoder::new();
		assert!(matches!(dec.decode(b"not json"), Err(DecodeError::Json(_))));
		assert!(matches!(dec.decode(&[0xff, 0xfe]), Err(DecodeError::Utf8(_))));
	}
}
