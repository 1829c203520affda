#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use streamhub_domain::{ConnectionStatus, PlatformId};

use crate::connection::{PlatformConnection, StreamConnection, StreamConnectionConfig};
use crate::credentials::CredentialProvider;
use crate::eventsub::MessageDecoder;
use crate::transport::WsConnector;

/// Descriptive data a provider exposes about its platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderMetadata {
	pub display_name: String,
	pub capabilities: Vec<String>,
}

/// Factory for one platform's connection.
pub trait ConnectionProvider: Send + Sync + 'static {
	fn platform_id(&self) -> &PlatformId;

	fn metadata(&self) -> ProviderMetadata {
		ProviderMetadata {
			display_name: self.platform_id().to_string(),
			capabilities: Vec::new(),
		}
	}

	fn create(&self) -> Arc<dyn PlatformConnection>;
}

/// Registry entry as reported by [`ConnectionRegistry::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct PlatformInfo {
	pub id: PlatformId,
	pub metadata: ProviderMetadata,
	pub instantiated: bool,
	pub status: Option<ConnectionStatus>,
}

/// Platform id → provider, with one lazily created connection per id.
pub struct ConnectionRegistry {
	providers: HashMap<PlatformId, Box<dyn ConnectionProvider>>,
	connections: Mutex<HashMap<PlatformId, Arc<dyn PlatformConnection>>>,
}

impl ConnectionRegistry {
	/// Later providers for an already registered id are ignored.
	pub fn new(providers: Vec<Box<dyn ConnectionProvider>>) -> Self {
		let mut map: HashMap<PlatformId, Box<dyn ConnectionProvider>> = HashMap::new();
		for provider in providers {
			let id = provider.platform_id().clone();
			if map.contains_key(&id) {
				tracing::warn!(platform = %id, "duplicate connection provider ignored");
				continue;
			}
			map.insert(id, provider);
		}

		Self {
			providers: map,
			connections: Mutex::new(HashMap::new()),
		}
	}

	/// The cached connection for `id`, creating it on first use.
	pub fn get(&self, id: &PlatformId) -> Option<Arc<dyn PlatformConnection>> {
		let provider = self.providers.get(id)?;
		let mut connections = self.connections.lock();
		let conn = connections.entry(id.clone()).or_insert_with(|| {
			tracing::debug!(platform = %id, "instantiating platform connection");
			provider.create()
		});
		Some(Arc::clone(conn))
	}

	/// Registered ids, sorted.
	pub fn platform_ids(&self) -> Vec<PlatformId> {
		let mut ids: Vec<_> = self.providers.keys().cloned().collect();
		ids.sort();
		ids
	}

	pub fn len(&self) -> usize {
		self.providers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.providers.is_empty()
	}

	pub fn snapshot(&self) -> Vec<PlatformInfo> {
		let connections = self.connections.lock();
		self.platform_ids()
			.into_iter()
			.filter_map(|id| {
				let provider = self.providers.get(&id)?;
				let conn = connections.get(&id);
				Some(PlatformInfo {
					metadata: provider.metadata(),
					instantiated: conn.is_some(),
					status: conn.map(|c| c.status()),
					id,
				})
			})
			.collect()
	}
}

/// Provider producing [`StreamConnection`]s.
pub struct StreamConnectionProvider {
	cfg: StreamConnectionConfig,
	metadata: ProviderMetadata,
	credentials: Arc<dyn CredentialProvider>,
	decoder: Arc<dyn MessageDecoder>,
	connector: Option<WsConnector>,
}

impl StreamConnectionProvider {
	pub fn new(
		cfg: StreamConnectionConfig,
		credentials: Arc<dyn CredentialProvider>,
		decoder: Arc<dyn MessageDecoder>,
	) -> Self {
		let metadata = ProviderMetadata {
			display_name: cfg.platform.to_string(),
			capabilities: vec!["events".to_string(), "heartbeat".to_string()],
		};
		Self {
			cfg,
			metadata,
			credentials,
			decoder,
			connector: None,
		}
	}

	pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
		self.metadata.display_name = name.into();
		self
	}

	pub fn with_connector(mut self, connector: WsConnector) -> Self {
		self.connector = Some(connector);
		self
	}
}

impl ConnectionProvider for StreamConnectionProvider {
	fn platform_id(&self) -> &PlatformId {
		&self.cfg.platform
	}

	fn metadata(&self) -> ProviderMetadata {
		self.metadata.clone()
	}

	fn create(&self) -> Arc<dyn PlatformConnection> {
		let credentials = Arc::clone(&self.credentials);
		let decoder = Arc::clone(&self.decoder);
		match &self.connector {
			Some(connector) => Arc::new(StreamConnection::with_connector(
				self.cfg.clone(),
				credentials,
				decoder,
				Arc::clone(connector),
			)),
			None => Arc::new(StreamConnection::new(self.cfg.clone(), credentials, decoder)),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use streamhub_domain::ConnectionState;
	use streamhub_util::endpoint::StreamEndpoint;

	use super::*;
	use crate::SecretString;
	use crate::credentials::StaticCredentialProvider;
	use crate::eventsub::EventSubDecoder;

	struct CountingProvider {
		inner: StreamConnectionProvider,
		created: Arc<AtomicUsize>,
	}

	impl ConnectionProvider for CountingProvider {
		fn platform_id(&self) -> &PlatformId {
			self.inner.platform_id()
		}

		fn create(&self) -> Arc<dyn PlatformConnection> {
			self.created.fetch_add(1, Ordering::SeqCst);
			self.inner.create()
		}
	}

	fn provider(id: &str) -> StreamConnectionProvider {
		let cfg = StreamConnectionConfig::new(
			PlatformId::new(id).unwrap(),
			StreamEndpoint::parse("wss://eventsub.example.com/ws").unwrap(),
		);
		StreamConnectionProvider::new(
			cfg,
			Arc::new(StaticCredentialProvider::new(Some(SecretString::new("tok")))),
			Arc::new(EventSubDecoder::new()),
		)
	}

	#[tokio::test]
	async fn get_instantiates_once_per_platform() {
		let created = Arc::new(AtomicUsize::new(0));
		let registry = ConnectionRegistry::new(vec![Box::new(CountingProvider {
			inner: provider("twitch"),
			created: Arc::clone(&created),
		})]);
		let id = PlatformId::new("twitch").unwrap();

		let a = registry.get(&id).expect("registered");
		let b = registry.get(&id).expect("registered");
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(created.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn unknown_platform_yields_none() {
		let registry = ConnectionRegistry::new(vec![Box::new(provider("twitch"))]);
		assert!(registry.get(&PlatformId::new("kick").unwrap()).is_none());
	}

	#[test]
	fn ids_are_sorted_and_duplicates_ignored() {
		let registry = ConnectionRegistry::new(vec![
			Box::new(provider("youtube")),
			Box::new(provider("kick")),
			Box::new(provider("twitch")),
			Box::new(provider("kick").with_display_name("second")),
		]);
		let ids: Vec<String> = registry.platform_ids().into_iter().map(|id| id.into_string()).collect();
		assert_eq!(ids, vec!["kick", "twitch", "youtube"]);
		assert_eq!(registry.len(), 3);
	}

	#[tokio::test]
	async fn snapshot_reports_instantiation_and_status() {
		let registry = ConnectionRegistry::new(vec![
			Box::new(provider("kick")),
			Box::new(provider("twitch").with_display_name("Twitch")),
		]);
		registry.get(&PlatformId::new("twitch").unwrap());

		let snapshot = registry.snapshot();
		assert_eq!(snapshot.len(), 2);

		let kick = &snapshot[0];
		assert_eq!(kick.id.as_str(), "kick");
		assert!(!kick.instantiated);
		assert!(kick.status.is_none());

		let twitch = &snapshot[1];
		assert_eq!(twitch.metadata.display_name, "Twitch");
		assert!(twitch.metadata.capabilities.contains(&"heartbeat".to_string()));
		assert!(twitch.instantiated);
		assert_eq!(twitch.status.as_ref().map(|s| s.state), Some(ConnectionState::Disconnected));
	}
}
