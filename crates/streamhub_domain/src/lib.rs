#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use streamhub_util::time::unix_ms;
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid platform id: {0}")]
	InvalidPlatform(String),
	#[error("unknown event type: {0}")]
	UnknownEventType(String),
	#[error("unknown connection state: {0}")]
	UnknownState(String),
}

/// Platform identifier (e.g. `twitch`, `kick`).
///
/// Normalized to lowercase; restricted to `[a-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformId(String);

impl PlatformId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		let id = id.trim().to_ascii_lowercase();
		if id.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if !id
			.chars()
			.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
		{
			return Err(ParseIdError::InvalidPlatform(id));
		}
		Ok(Self(id))
	}

	/// Source of process-wide system events that belong to no single platform.
	pub fn system() -> Self {
		Self("system".to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for PlatformId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for PlatformId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		PlatformId::new(s)
	}
}

impl TryFrom<String> for PlatformId {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		PlatformId::new(value)
	}
}

impl From<PlatformId> for String {
	fn from(value: PlatformId) -> Self {
		value.0
	}
}

/// Unique per-publish event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub uuid::Uuid);

impl EventId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for EventId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	ChatMessage,
	Subscription,
	Follow,
	Raid,
	Bits,
	ChannelPointRedemption,
	System,
	Unknown,
}

impl EventType {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventType::ChatMessage => "chat_message",
			EventType::Subscription => "subscription",
			EventType::Follow => "follow",
			EventType::Raid => "raid",
			EventType::Bits => "bits",
			EventType::ChannelPointRedemption => "channel_point_redemption",
			EventType::System => "system",
			EventType::Unknown => "unknown",
		}
	}
}

impl fmt::Display for EventType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for EventType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"chat_message" | "chat" => Ok(EventType::ChatMessage),
			"subscription" | "sub" => Ok(EventType::Subscription),
			"follow" => Ok(EventType::Follow),
			"raid" => Ok(EventType::Raid),
			"bits" | "cheer" => Ok(EventType::Bits),
			"channel_point_redemption" | "redemption" => Ok(EventType::ChannelPointRedemption),
			"system" => Ok(EventType::System),
			"unknown" => Ok(EventType::Unknown),
			other => Err(ParseIdError::UnknownEventType(other.to_string())),
		}
	}
}

/// Loosely typed event payload.
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Optional event metadata, attached at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
	#[serde(default)]
	pub viewer_id: Option<String>,

	#[serde(default)]
	pub channel_id: Option<String>,

	/// Higher is more important.
	#[serde(default)]
	pub importance: i32,

	/// Absent means the event never expires.
	#[serde(default)]
	pub expires_at: Option<SystemTime>,

	pub correlation_id: String,
}

impl Default for EventMetadata {
	fn default() -> Self {
		Self {
			viewer_id: None,
			channel_id: None,
			importance: 0,
			expires_at: None,
			correlation_id: uuid::Uuid::new_v4().to_string(),
		}
	}
}

impl EventMetadata {
	pub fn with_viewer_id(mut self, viewer_id: impl Into<String>) -> Self {
		self.viewer_id = Some(viewer_id.into());
		self
	}

	pub fn with_channel_id(mut self, channel_id: impl Into<String>) -> Self {
		self.channel_id = Some(channel_id.into());
		self
	}

	pub fn with_importance(mut self, importance: i32) -> Self {
		self.importance = importance;
		self
	}

	pub fn with_expires_at(mut self, expires_at: SystemTime) -> Self {
		self.expires_at = Some(expires_at);
		self
	}

	pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
		self.correlation_id = correlation_id.into();
		self
	}

	pub fn is_expired_at(&self, now: SystemTime) -> bool {
		self.expires_at.is_some_and(|at| at <= now)
	}
}

/// Immutable platform event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
	pub id: EventId,

	#[serde(rename = "type")]
	pub kind: EventType,

	pub created_at: SystemTime,

	/// Source platform.
	pub platform: PlatformId,

	#[serde(default)]
	pub payload: Payload,

	#[serde(default)]
	pub metadata: Option<EventMetadata>,
}

impl Event {
	/// Construct with a fresh id and `created_at = now`.
	pub fn new(kind: EventType, platform: PlatformId, payload: Payload) -> Self {
		Self {
			id: EventId::new_v4(),
			kind,
			created_at: SystemTime::now(),
			platform,
			payload,
			metadata: None,
		}
	}

	pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
		self.metadata = Some(metadata);
		self
	}

	pub fn importance(&self) -> i32 {
		self.metadata.as_ref().map(|m| m.importance).unwrap_or(0)
	}

	pub fn is_expired_at(&self, now: SystemTime) -> bool {
		self.metadata.as_ref().is_some_and(|m| m.is_expired_at(now))
	}

	/// Payload value as a string slice, if present and a JSON string.
	pub fn payload_str(&self, key: &str) -> Option<&str> {
		self.payload.get(key).and_then(|v| v.as_str())
	}

	pub fn payload_i64(&self, key: &str) -> Option<i64> {
		self.payload.get(key).and_then(|v| v.as_i64())
	}
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Failed,
	ReconnectScheduled,
}

impl ConnectionState {
	/// Wire name.
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Disconnected => "DISCONNECTED",
			ConnectionState::Connecting => "CONNECTING",
			ConnectionState::Connected => "CONNECTED",
			ConnectionState::Failed => "FAILED",
			ConnectionState::ReconnectScheduled => "RECONNECT_SCHEDULED",
		}
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ConnectionState {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().as_str() {
			"" => Err(ParseIdError::Empty),
			"DISCONNECTED" => Ok(ConnectionState::Disconnected),
			"CONNECTING" => Ok(ConnectionState::Connecting),
			"CONNECTED" => Ok(ConnectionState::Connected),
			"FAILED" => Ok(ConnectionState::Failed),
			"RECONNECT_SCHEDULED" => Ok(ConnectionState::ReconnectScheduled),
			other => Err(ParseIdError::UnknownState(other.to_string())),
		}
	}
}

/// Immutable connection status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
	pub state: ConnectionState,
	pub detail: String,
	pub fatal: bool,
	pub connected_since: Option<SystemTime>,
}

impl ConnectionStatus {
	pub fn disconnected(detail: impl Into<String>) -> Self {
		Self {
			state: ConnectionState::Disconnected,
			detail: detail.into(),
			fatal: false,
			connected_since: None,
		}
	}

	pub fn connecting(detail: impl Into<String>) -> Self {
		Self {
			state: ConnectionState::Connecting,
			detail: detail.into(),
			fatal: false,
			connected_since: None,
		}
	}

	pub fn connected(detail: impl Into<String>, since: SystemTime) -> Self {
		Self {
			state: ConnectionState::Connected,
			detail: detail.into(),
			fatal: false,
			connected_since: Some(since),
		}
	}

	pub fn failed(detail: impl Into<String>, fatal: bool) -> Self {
		Self {
			state: ConnectionState::Failed,
			detail: detail.into(),
			fatal,
			connected_since: None,
		}
	}

	pub fn reconnect_scheduled(detail: impl Into<String>) -> Self {
		Self {
			state: ConnectionState::ReconnectScheduled,
			detail: detail.into(),
			fatal: false,
			connected_since: None,
		}
	}

	pub fn is_connected(&self) -> bool {
		self.state == ConnectionState::Connected
	}

	pub fn is_fatal(&self) -> bool {
		self.state == ConnectionState::Failed && self.fatal
	}
}

impl Default for ConnectionStatus {
	fn default() -> Self {
		Self::disconnected("")
	}
}

/// Payload keys of lifecycle (system) events.
pub mod lifecycle {
	use std::time::SystemTime;

	use super::*;

	pub const KEY_PLATFORM: &str = "platform";
	pub const KEY_STATE: &str = "state";
	pub const KEY_DETAIL: &str = "detail";
	pub const KEY_CONNECTED_SINCE: &str = "connectedSince";
	pub const KEY_LAST_SUCCESSFUL: &str = "lastSuccessful";

	/// Build the `system` event published for a status transition.
	pub fn status_event(platform: &PlatformId, status: &ConnectionStatus, last_successful: Option<SystemTime>) -> Event {
		let mut payload = Payload::new();
		payload.insert(KEY_PLATFORM.to_string(), platform.as_str().into());
		payload.insert(KEY_STATE.to_string(), status.state.as_str().into());
		payload.insert(KEY_DETAIL.to_string(), status.detail.clone().into());
		payload.insert(
			KEY_CONNECTED_SINCE.to_string(),
			status.connected_since.map(unix_ms).unwrap_or(0).into(),
		);
		payload.insert(
			KEY_LAST_SUCCESSFUL.to_string(),
			last_successful.map(unix_ms).unwrap_or(0).into(),
		);
		Event::new(EventType::System, platform.clone(), payload)
	}

	/// Decoded view of a lifecycle event.
	#[derive(Debug, Clone, PartialEq, Eq)]
	pub struct StatusView {
		pub platform: PlatformId,
		pub state: ConnectionState,
		pub detail: String,
		pub connected_since_ms: i64,
		pub last_successful_ms: i64,
	}

	/// Returns `None` for events that are not lifecycle status events.
	pub fn parse_status_event(ev: &Event) -> Option<StatusView> {
		if ev.kind != EventType::System {
			return None;
		}
		let platform = PlatformId::new(ev.payload_str(KEY_PLATFORM)?).ok()?;
		let state = ev.payload_str(KEY_STATE)?.parse().ok()?;
		Some(StatusView {
			platform,
			state,
			detail: ev.payload_str(KEY_DETAIL).unwrap_or_default().to_string(),
			connected_since_ms: ev.payload_i64(KEY_CONNECTED_SINCE).unwrap_or(0),
			last_successful_ms: ev.payload_i64(KEY_LAST_SUCCESSFUL).unwrap_or(0),
		})
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[test]
	fn platform_id_normalizes_and_validates() {
		let id = PlatformId::new("  Twitch ").unwrap();
		assert_eq!(id.as_str(), "twitch");
		assert_eq!(PlatformId::new("").unwrap_err(), ParseIdError::Empty);
		assert!(matches!(
			PlatformId::new("bad id"),
			Err(ParseIdError::InvalidPlatform(_))
		));
	}

	#[test]
	fn event_type_round_trips_through_str() {
		for kind in [
			EventType::ChatMessage,
			EventType::Subscription,
			EventType::Follow,
			EventType::Raid,
			EventType::Bits,
			EventType::ChannelPointRedemption,
			EventType::System,
			EventType::Unknown,
		] {
			assert_eq!(kind.as_str().parse::<EventType>().unwrap(), kind);
		}
		assert!("nope".parse::<EventType>().is_err());
	}

	#[test]
	fn metadata_defaults_to_fresh_correlation_id() {
		let a = EventMetadata::default();
		let b = EventMetadata::default();
		assert_eq!(a.importance, 0);
		assert!(a.expires_at.is_none());
		assert_ne!(a.correlation_id, b.correlation_id);
	}

	#[test]
	fn expiry_only_applies_when_set() {
		let platform = PlatformId::new("twitch").unwrap();
		let now = SystemTime::now();

		let forever = Event::new(EventType::Follow, platform.clone(), Payload::new());
		assert!(!forever.is_expired_at(now));

		let stale = Event::new(EventType::Follow, platform, Payload::new())
			.with_metadata(EventMetadata::default().with_expires_at(now - Duration::from_secs(1)));
		assert!(stale.is_expired_at(now));
	}

	#[test]
	fn lifecycle_event_carries_wire_keys() {
		let platform = PlatformId::new("kick").unwrap();
		let since = streamhub_util::time::from_unix_ms(1_000);
		let status = ConnectionStatus::connected("ok", since);
		let ev = lifecycle::status_event(&platform, &status, Some(since));

		assert_eq!(ev.kind, EventType::System);
		assert_eq!(ev.platform, platform);
		assert_eq!(ev.payload_str("platform"), Some("kick"));
		assert_eq!(ev.payload_str("state"), Some("CONNECTED"));
		assert_eq!(ev.payload_i64("connectedSince"), Some(1_000));
		assert_eq!(ev.payload_i64("lastSuccessful"), Some(1_000));

		let view = lifecycle::parse_status_event(&ev).unwrap();
		assert_eq!(view.state, ConnectionState::Connected);
		assert_eq!(view.detail, "ok");
	}

	#[test]
	fn lifecycle_event_uses_zero_for_missing_timestamps() {
		let platform = PlatformId::new("kick").unwrap();
		let ev = lifecycle::status_event(&platform, &ConnectionStatus::failed("boom", true), None);
		assert_eq!(ev.payload_i64("connectedSince"), Some(0));
		assert_eq!(ev.payload_i64("lastSuccessful"), Some(0));
	}
}
