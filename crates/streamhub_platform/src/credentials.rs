#![forbid(unsafe_code)]

use std::time::SystemTime;

use parking_lot::RwLock;
use thiserror::Error;

use crate::SecretString;

/// Bearer credential handed to a transport.
#[derive(Debug, Clone)]
pub struct Credential {
	pub access_token: SecretString,
	pub expires_at: Option<SystemTime>,
}

impl Credential {
	pub fn bearer(token: SecretString) -> Self {
		Self {
			access_token: token,
			expires_at: None,
		}
	}
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
	/// Nothing configured (yet); retrying later may succeed.
	#[error("no credential available")]
	Unavailable,

	/// Expired and cannot be refreshed.
	#[error("credential expired and cannot be refreshed")]
	Expired,

	#[error("credential provider error: {0}")]
	Provider(String),
}

impl CredentialError {
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::Expired)
	}

	/// Short machine-readable tag used in status details.
	pub fn detail(&self) -> &'static str {
		match self {
			Self::Unavailable => "credential.unavailable",
			Self::Expired => "credential.expired",
			Self::Provider(_) => "credential.provider",
		}
	}
}

/// Source of valid credentials for a platform connection.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
	/// Return a currently valid credential, refreshing it if needed.
	async fn ensure_valid(&self) -> Result<Credential, CredentialError>;
}

/// Credential provider backed by a fixed (replaceable) token.
#[derive(Debug, Default)]
pub struct StaticCredentialProvider {
	current: RwLock<Option<Credential>>,
}

impl StaticCredentialProvider {
	pub fn new(token: Option<SecretString>) -> Self {
		Self {
			current: RwLock::new(token.filter(|t| !t.is_empty()).map(Credential::bearer)),
		}
	}

	pub fn with_expiry(token: SecretString, expires_at: SystemTime) -> Self {
		Self {
			current: RwLock::new(Some(Credential {
				access_token: token,
				expires_at: Some(expires_at),
			})),
		}
	}

	/// Replace the stored credential.
	pub fn update(&self, credential: Option<Credential>) {
		*self.current.write() = credential;
	}
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredentialProvider {
	async fn ensure_valid(&self) -> Result<Credential, CredentialError> {
		let current = self.current.read().clone();
		let Some(credential) = current else {
			return Err(CredentialError::Unavailable);
		};

		if credential
			.expires_at
			.is_some_and(|at| SystemTime::now().duration_since(at).is_ok())
		{
			return Err(CredentialError::Expired);
		}

		Ok(credential)
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn missing_token_is_unavailable_and_transient() {
		let provider = StaticCredentialProvider::new(Some(SecretString::new("  ")));
		let err = provider.ensure_valid().await.unwrap_err();
		assert_eq!(err, CredentialError::Unavailable);
		assert!(!err.is_fatal());
	}

	#[tokio::test]
	async fn expired_token_is_fatal() {
		let provider = StaticCredentialProvider::with_expiry(
			SecretString::new("tok"),
			SystemTime::now() - Duration::from_secs(5),
		);
		let err = provider.ensure_valid().await.unwrap_err();
		assert!(err.is_fatal());
		assert_eq!(err.detail(), "credential.expired");
	}

	#[tokio::test]
	async fn update_replaces_token() {
		let provider = StaticCredentialProvider::new(None);
		provider.update(Some(Credential::bearer(SecretString::new("fresh"))));
		let cred = provider.ensure_valid().await.unwrap();
		assert_eq!(cred.access_token.expose(), "fresh");
	}
}
