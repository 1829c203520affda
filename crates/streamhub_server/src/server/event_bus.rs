#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use streamhub_domain::Event;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::server::persistence::EventPersistence;
use crate::server::reporter::{ErrorReporter, TracingErrorReporter, panic_error};

/// Admission behaviour when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
	/// Reject the incoming event.
	DropNew,
	/// Evict the oldest buffered event, then admit.
	DropOldest,
	/// Wait until a purge frees space or the bus stops.
	Block,
}

impl FromStr for BackpressurePolicy {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
			"drop_new" => Ok(Self::DropNew),
			"drop_oldest" => Ok(Self::DropOldest),
			"block" => Ok(Self::Block),
			other => Err(ConfigError::invalid(
				"bus.backpressure",
				format!("unknown policy {other:?} (expected drop_new, drop_oldest or block)"),
			)),
		}
	}
}

/// Event bus configuration.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
	pub capacity: usize,
	pub backpressure: BackpressurePolicy,
	/// Maximum concurrent dispatch rounds.
	pub dispatcher_threads: usize,
	pub purge_interval: Duration,
	pub persistence_enabled: bool,
}

impl Default for EventBusConfig {
	fn default() -> Self {
		Self {
			capacity: 10_000,
			backpressure: BackpressurePolicy::DropOldest,
			dispatcher_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
			purge_interval: Duration::from_millis(5_000),
			persistence_enabled: false,
		}
	}
}

impl EventBusConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.capacity == 0 {
			return Err(ConfigError::invalid("bus.capacity", "must be >= 1"));
		}
		if self.dispatcher_threads == 0 {
			return Err(ConfigError::invalid("bus.dispatcher_threads", "must be >= 1"));
		}
		if self.purge_interval.is_zero() {
			return Err(ConfigError::invalid("bus.purge_interval_ms", "must be > 0"));
		}
		Ok(())
	}
}

/// Consumer side of a subscription.
pub trait Subscriber: Send + Sync + 'static {
	fn matches(&self, _event: &Event) -> bool {
		true
	}

	fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

struct FnSubscriber<F>(F);

impl<F> Subscriber for FnSubscriber<F>
where
	F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
	fn handle(&self, event: &Event) -> anyhow::Result<()> {
		(self.0)(event)
	}
}

type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// A subscriber plus its filter and priority, ready to register.
#[derive(Clone)]
pub struct Subscription {
	subscriber: Arc<dyn Subscriber>,
	filter: Option<Filter>,
	priority: i32,
}

impl Subscription {
	pub fn new(subscriber: impl Subscriber) -> Self {
		Self {
			subscriber: Arc::new(subscriber),
			filter: None,
			priority: 0,
		}
	}

	/// Subscription backed by a closure.
	pub fn from_fn<F>(handler: F) -> Self
	where
		F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
	{
		Self::new(FnSubscriber(handler))
	}

	/// Additional predicate, evaluated before [`Subscriber::matches`].
	pub fn with_filter<P>(mut self, filter: P) -> Self
	where
		P: Fn(&Event) -> bool + Send + Sync + 'static,
	{
		self.filter = Some(Arc::new(filter));
		self
	}

	/// Higher runs first.
	pub fn with_priority(mut self, priority: i32) -> Self {
		self.priority = priority;
		self
	}

	#[allow(dead_code)]
	pub fn priority(&self) -> i32 {
		self.priority
	}

	fn matches(&self, event: &Event) -> bool {
		self.filter.as_ref().is_none_or(|f| f(event)) && self.subscriber.matches(event)
	}
}

impl fmt::Debug for Subscription {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Subscription")
			.field("priority", &self.priority)
			.field("filtered", &self.filter.is_some())
			.finish()
	}
}

/// Opaque registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

impl fmt::Display for SubscriptionHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusMetrics {
	pub published: u64,
	pub delivered: u64,
	pub filtered: u64,
	pub dropped: u64,
	pub persisted: u64,
	pub persist_failures: u64,
	pub subscriber_failures: u64,
	pub buffered: usize,
	pub subscriptions: usize,
	/// Running average from admission to consumer completion.
	pub avg_dispatch_latency_us: f64,
}

#[derive(Debug, Default)]
struct Counters {
	published: AtomicU64,
	delivered: AtomicU64,
	filtered: AtomicU64,
	dropped: AtomicU64,
	persisted: AtomicU64,
	persist_failures: AtomicU64,
	subscriber_failures: AtomicU64,
	latency_total_us: AtomicU64,
	latency_samples: AtomicU64,
}

struct Registered {
	seq: u64,
	subscription: Subscription,
}

/// Bounded publish/subscribe hub with priority dispatch and periodic purge.
#[derive(Clone)]
pub struct EventBus {
	inner: Arc<Inner>,
}

struct Inner {
	cfg: EventBusConfig,
	running: AtomicBool,
	buffer: Mutex<VecDeque<Arc<Event>>>,
	space: Notify,
	subscriptions: RwLock<HashMap<SubscriptionHandle, Registered>>,
	next_seq: AtomicU64,
	dispatch_permits: Arc<Semaphore>,
	persistence: Option<Arc<dyn EventPersistence>>,
	reporter: Arc<dyn ErrorReporter>,
	counters: Counters,
	purge_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
	/// Start a bus without persistence, reporting failures through `tracing`.
	pub fn start(cfg: EventBusConfig) -> Result<Self, ConfigError> {
		Self::start_with(cfg, None, Arc::new(TracingErrorReporter))
	}

	/// Start a bus and its purge timer.
	///
	/// `persistence` is only used when `cfg.persistence_enabled` is set.
	pub fn start_with(
		cfg: EventBusConfig,
		persistence: Option<Arc<dyn EventPersistence>>,
		reporter: Arc<dyn ErrorReporter>,
	) -> Result<Self, ConfigError> {
		cfg.validate()?;

		let persistence = persistence.filter(|_| cfg.persistence_enabled);
		let bus = Self {
			inner: Arc::new(Inner {
				dispatch_permits: Arc::new(Semaphore::new(cfg.dispatcher_threads)),
				buffer: Mutex::new(VecDeque::with_capacity(cfg.capacity.min(4_096))),
				cfg,
				running: AtomicBool::new(true),
				space: Notify::new(),
				subscriptions: RwLock::new(HashMap::new()),
				next_seq: AtomicU64::new(0),
				persistence,
				reporter,
				counters: Counters::default(),
				purge_task: Mutex::new(None),
			}),
		};

		let weak = Arc::downgrade(&bus.inner);
		let period = bus.inner.cfg.purge_interval;
		let task = tokio::spawn(async move {
			let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				let Some(inner) = weak.upgrade() else {
					break;
				};
				if !inner.running.load(Ordering::Acquire) {
					break;
				}
				inner.purge(SystemTime::now());
			}
		});
		*bus.inner.purge_task.lock() = Some(task);

		info!(
			capacity = bus.inner.cfg.capacity,
			backpressure = ?bus.inner.cfg.backpressure,
			dispatchers = bus.inner.cfg.dispatcher_threads,
			"event bus started"
		);
		Ok(bus)
	}

	#[allow(dead_code)]
	pub fn config(&self) -> &EventBusConfig {
		&self.inner.cfg
	}

	#[allow(dead_code)]
	pub fn is_running(&self) -> bool {
		self.inner.running.load(Ordering::Acquire)
	}

	/// Stop admitting events, release blocked publishers and cancel the purge timer. Idempotent.
	pub fn stop(&self) {
		if !self.inner.running.swap(false, Ordering::AcqRel) {
			return;
		}
		self.inner.space.notify_waiters();
		if let Some(task) = self.inner.purge_task.lock().take() {
			task.abort();
		}
		info!("event bus stopped");
	}

	/// Admit `event` under the configured backpressure policy and dispatch it.
	///
	/// Never fails; rejected or abandoned events are only visible in [`BusMetrics`].
	pub async fn publish(&self, event: Event) {
		let inner = &self.inner;
		let event = Arc::new(event);

		loop {
			let notified = inner.space.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			{
				let mut buffer = inner.buffer.lock();
				if !inner.running.load(Ordering::Acquire) {
					return;
				}

				if buffer.len() < inner.cfg.capacity {
					buffer.push_back(Arc::clone(&event));
					break;
				}

				match inner.cfg.backpressure {
					BackpressurePolicy::DropNew => {
						drop(buffer);
						inner.record_drop();
						return;
					}
					BackpressurePolicy::DropOldest => {
						buffer.pop_front();
						buffer.push_back(Arc::clone(&event));
						drop(buffer);
						inner.record_drop();
						break;
					}
					BackpressurePolicy::Block => {}
				}
			}

			notified.await;
		}

		inner.counters.published.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("streamhub_bus_published_total").increment(1);

		inner.spawn_dispatch(Arc::clone(&event), Instant::now());
		inner.spawn_persist(event);
	}

	pub fn subscribe(&self, subscription: Subscription) -> SubscriptionHandle {
		let handle = SubscriptionHandle(Uuid::new_v4());
		let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
		self.inner
			.subscriptions
			.write()
			.insert(handle, Registered { seq, subscription });
		handle
	}

	/// Returns whether the handle was still registered.
	#[allow(dead_code)]
	pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
		self.inner.subscriptions.write().remove(&handle).is_some()
	}

	/// Up to `limit` most recently buffered events, oldest first.
	#[allow(dead_code)]
	pub fn recent_events(&self, limit: usize) -> Vec<Arc<Event>> {
		let buffer = self.inner.buffer.lock();
		let skip = buffer.len().saturating_sub(limit);
		buffer.iter().skip(skip).cloned().collect()
	}

	#[allow(dead_code)]
	pub fn buffered(&self) -> usize {
		self.inner.buffer.lock().len()
	}

	/// Run one maintenance cycle now.
	#[allow(dead_code)]
	pub fn purge(&self) -> usize {
		self.inner.purge(SystemTime::now())
	}

	pub fn metrics(&self) -> BusMetrics {
		let c = &self.inner.counters;
		let samples = c.latency_samples.load(Ordering::Relaxed);
		let avg = if samples == 0 {
			0.0
		} else {
			c.latency_total_us.load(Ordering::Relaxed) as f64 / samples as f64
		};

		BusMetrics {
			published: c.published.load(Ordering::Relaxed),
			delivered: c.delivered.load(Ordering::Relaxed),
			filtered: c.filtered.load(Ordering::Relaxed),
			dropped: c.dropped.load(Ordering::Relaxed),
			persisted: c.persisted.load(Ordering::Relaxed),
			persist_failures: c.persist_failures.load(Ordering::Relaxed),
			subscriber_failures: c.subscriber_failures.load(Ordering::Relaxed),
			buffered: self.buffered(),
			subscriptions: self.inner.subscriptions.read().len(),
			avg_dispatch_latency_us: avg,
		}
	}
}

impl Inner {
	fn record_drop(&self) {
		self.counters.dropped.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("streamhub_bus_dropped_total").increment(1);
	}

	/// Drop expired events and trim to capacity, keeping the newest in order.
	fn purge(&self, now: SystemTime) -> usize {
		let (removed, remaining) = {
			let mut buffer = self.buffer.lock();
			let before = buffer.len();
			let mut kept: VecDeque<Arc<Event>> = buffer.drain(..).filter(|ev| !ev.is_expired_at(now)).collect();
			let overflow = kept.len().saturating_sub(self.cfg.capacity);
			kept.drain(..overflow);
			*buffer = kept;
			(before - buffer.len(), buffer.len())
		};

		metrics::gauge!("streamhub_bus_buffered").set(remaining as f64);
		if removed > 0 {
			debug!(removed, remaining, "event bus purge");
			self.space.notify_waiters();
		}
		removed
	}

	fn spawn_dispatch(self: &Arc<Self>, event: Arc<Event>, admitted: Instant) {
		let inner = Arc::clone(self);
		let permits = Arc::clone(&self.dispatch_permits);
		tokio::spawn(async move {
			let Ok(permit) = permits.acquire_owned().await else {
				return;
			};
			let result = tokio::task::spawn_blocking(move || {
				let _permit = permit;
				inner.dispatch(&event, admitted);
			})
			.await;
			if let Err(e) = result {
				debug!(error = %e, "dispatch task failed");
			}
		});
	}

	/// Invoke every matching subscriber in descending priority, then registration order.
	fn dispatch(&self, event: &Event, admitted: Instant) {
		let mut targets: Vec<(i32, u64, Subscription)> = self
			.subscriptions
			.read()
			.values()
			.map(|r| (r.subscription.priority, r.seq, r.subscription.clone()))
			.collect();
		targets.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

		for (_, _, sub) in targets {
			let matched = match catch_unwind(AssertUnwindSafe(|| sub.matches(event))) {
				Ok(m) => m,
				Err(payload) => {
					self.subscriber_failed("bus.filter", panic_error(payload));
					continue;
				}
			};

			if !matched {
				self.counters.filtered.fetch_add(1, Ordering::Relaxed);
				metrics::counter!("streamhub_bus_filtered_total").increment(1);
				continue;
			}

			match catch_unwind(AssertUnwindSafe(|| sub.subscriber.handle(event))) {
				Ok(Ok(())) => {
					let elapsed_us = admitted.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
					self.counters.delivered.fetch_add(1, Ordering::Relaxed);
					self.counters.latency_total_us.fetch_add(elapsed_us, Ordering::Relaxed);
					self.counters.latency_samples.fetch_add(1, Ordering::Relaxed);
					metrics::counter!("streamhub_bus_delivered_total").increment(1);
				}
				Ok(Err(e)) => self.subscriber_failed("bus.subscriber", e),
				Err(payload) => self.subscriber_failed("bus.subscriber", panic_error(payload)),
			}
		}
	}

	fn subscriber_failed(&self, context: &str, error: anyhow::Error) {
		self.counters.subscriber_failures.fetch_add(1, Ordering::Relaxed);
		metrics::counter!("streamhub_bus_subscriber_failures_total").increment(1);
		self.reporter.report(context, &error);
	}

	fn spawn_persist(self: &Arc<Self>, event: Arc<Event>) {
		let Some(persistence) = self.persistence.clone() else {
			return;
		};
		let inner = Arc::clone(self);
		tokio::spawn(async move {
			match persistence.save(&event).await {
				Ok(()) => {
					inner.counters.persisted.fetch_add(1, Ordering::Relaxed);
				}
				Err(e) => {
					inner.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
					metrics::counter!("streamhub_bus_persist_failures_total").increment(1);
					inner.reporter.report("bus.persist", &e.context(format!("save event {}", event.id)));
				}
			}
		});
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		if let Some(task) = self.purge_task.get_mut().take() {
			task.abort();
		}
	}
}
