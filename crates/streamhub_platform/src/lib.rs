#![forbid(unsafe_code)]

pub mod connection;
pub mod credentials;
pub mod eventsub;
pub mod registry;
pub mod transport;

use std::fmt;

use uuid::Uuid;

pub use connection::{ConnectError, PlatformConnection, StreamConnection, StreamConnectionConfig};
pub use credentials::{Credential, CredentialError, CredentialProvider, StaticCredentialProvider};
pub use eventsub::{DecodeError, DecodedMessage, EventSubDecoder, MessageDecoder, MessageKind};
pub use registry::{ConnectionProvider, ConnectionRegistry, PlatformInfo, ProviderMetadata, StreamConnectionProvider};
pub use transport::{StreamingTransport, TransportError, TransportEvent, WsConnector, heartbeat_timeout};

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}
