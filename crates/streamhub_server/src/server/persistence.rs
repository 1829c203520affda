#![forbid(unsafe_code)]

use std::collections::VecDeque;

use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use streamhub_domain::Event;
use streamhub_util::time::unix_ms;

/// Best-effort side channel the bus forwards admitted events to.
#[async_trait::async_trait]
pub trait EventPersistence: Send + Sync + 'static {
	async fn save(&self, event: &Event) -> anyhow::Result<()>;
}

/// Bounded in-process ring of saved events.
#[derive(Debug)]
pub struct InMemoryEventStore {
	capacity: usize,
	events: Mutex<VecDeque<Event>>,
}

impl InMemoryEventStore {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			events: Mutex::new(VecDeque::new()),
		}
	}

	#[allow(dead_code)]
	pub fn len(&self) -> usize {
		self.events.lock().len()
	}

	#[allow(dead_code)]
	pub fn is_empty(&self) -> bool {
		self.events.lock().is_empty()
	}

	/// Saved events, oldest first.
	pub fn snapshot(&self) -> Vec<Event> {
		self.events.lock().iter().cloned().collect()
	}
}

#[async_trait::async_trait]
impl EventPersistence for InMemoryEventStore {
	async fn save(&self, event: &Event) -> anyhow::Result<()> {
		let mut events = self.events.lock();
		while events.len() >= self.capacity {
			events.pop_front();
		}
		events.push_back(event.clone());
		Ok(())
	}
}

#[derive(Debug, Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// sqlx-backed event store (`sqlite:` or `postgres:` URLs).
#[derive(Debug, Clone)]
pub struct SqlEventStore {
	backend: SqlBackend,
}

impl SqlEventStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			Self::from_sqlite(pool).await
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	pub async fn from_sqlite(pool: sqlx::SqlitePool) -> anyhow::Result<Self> {
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;
		Ok(Self {
			backend: SqlBackend::Sqlite(pool),
		})
	}

	#[allow(dead_code)]
	pub async fn count(&self) -> anyhow::Result<i64> {
		let (n,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT COUNT(*) FROM bus_events")
				.fetch_one(pool)
				.await
				.context("count events (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT COUNT(*) FROM bus_events")
				.fetch_one(pool)
				.await
				.context("count events (postgres)")?,
		};
		Ok(n)
	}

	/// Most recent events for a platform, newest first.
	#[allow(dead_code)]
	pub async fn recent_for_platform(&self, platform: &str, limit: i64) -> anyhow::Result<Vec<Event>> {
		let rows: Vec<(String,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT payload FROM bus_events WHERE platform = ? ORDER BY created_at_ms DESC, rowid DESC LIMIT ?",
			)
			.bind(platform)
			.bind(limit)
			.fetch_all(pool)
			.await
			.context("select events (sqlite)")?,
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT payload FROM bus_events WHERE platform = $1 ORDER BY created_at_ms DESC LIMIT $2")
					.bind(platform)
					.bind(limit)
					.fetch_all(pool)
					.await
					.context("select events (postgres)")?
			}
		};

		rows.into_iter()
			.map(|(json,)| serde_json::from_str::<Event>(&json).context("decode stored event"))
			.collect()
	}
}

#[async_trait::async_trait]
impl EventPersistence for SqlEventStore {
	async fn save(&self, event: &Event) -> anyhow::Result<()> {
		let id = event.id.to_string();
		let kind = event.kind.as_str();
		let platform = event.platform.as_str();
		let created_at_ms = unix_ms(event.created_at);
		let importance = event.importance();
		let correlation_id = event.metadata.as_ref().map(|m| m.correlation_id.clone());
		let json = serde_json::to_string(event).context("encode event")?;

		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO bus_events (id, event_type, platform, created_at_ms, importance, correlation_id, payload) VALUES (?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(id)
				.bind(kind)
				.bind(platform)
				.bind(created_at_ms)
				.bind(importance)
				.bind(correlation_id)
				.bind(json)
				.execute(pool)
				.await
				.context("insert event (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO bus_events (id, event_type, platform, created_at_ms, importance, correlation_id, payload) VALUES ($1, $2, $3, $4, $5, $6, $7)",
				)
				.bind(id)
				.bind(kind)
				.bind(platform)
				.bind(created_at_ms)
				.bind(importance)
				.bind(correlation_id)
				.bind(json)
				.execute(pool)
				.await
				.context("insert event (postgres)")?;
			}
		}
		Ok(())
	}
}
