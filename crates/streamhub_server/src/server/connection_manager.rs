#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use streamhub_domain::lifecycle::status_event;
use streamhub_domain::{ConnectionState, ConnectionStatus, Event, EventType, Payload, PlatformId};
use streamhub_platform::{ConnectionRegistry, PlatformConnection};
use streamhub_util::time::unix_ms;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::server::backoff::ReconnectPolicy;
use crate::server::event_bus::EventBus;
use crate::server::reporter::{ErrorReporter, TracingErrorReporter, panic_error};

/// Payload key of the periodic status summary event.
pub const SUMMARY_KEY: &str = "summary";

/// Detail of the fatal failure recorded once `max_attempts` is exceeded.
pub const DETAIL_EXHAUSTED: &str = "reconnect.exhausted";

/// How long shutdown waits for queued lifecycle events to reach the bus.
const LIFECYCLE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
	pub reconnect: ReconnectPolicy,
	/// Global switch; when off, `start` leaves every platform DISCONNECTED.
	pub connections_enabled: bool,
	pub summary_interval: Option<Duration>,
}

impl Default for ConnectionManagerConfig {
	fn default() -> Self {
		Self {
			reconnect: ReconnectPolicy::default(),
			connections_enabled: true,
			summary_interval: None,
		}
	}
}

impl ConnectionManagerConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		self.reconnect.validate()?;
		if self.summary_interval.is_some_and(|d| d.is_zero()) {
			return Err(ConfigError::invalid("reconnect.summary_interval_ms", "must be > 0"));
		}
		Ok(())
	}
}

/// Immutable per-platform view, swapped whole on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateSnapshot {
	pub platform: PlatformId,
	pub status: ConnectionStatus,
	pub last_successful_connect: Option<SystemTime>,
	/// Failures since the last stable period.
	pub attempt: u32,
	/// Un-jittered base of the most recently scheduled retry.
	pub current_backoff_ms: u64,
	/// Jittered delay actually scheduled.
	pub last_scheduled_delay_ms: u64,
	pub connects: u64,
	pub disconnects: u64,
	pub failed_attempts: u64,
}

impl ConnectionStateSnapshot {
	fn initial(platform: PlatformId, initial_backoff_ms: u64) -> Self {
		Self {
			platform,
			status: ConnectionStatus::disconnected("not started"),
			last_successful_connect: None,
			attempt: 0,
			current_backoff_ms: initial_backoff_ms,
			last_scheduled_delay_ms: 0,
			connects: 0,
			disconnects: 0,
			failed_attempts: 0,
		}
	}

	#[allow(dead_code)]
	pub fn state(&self) -> ConnectionState {
		self.status.state
	}

	fn to_json(&self) -> serde_json::Value {
		json!({
			"platform": self.platform.as_str(),
			"state": self.status.state.as_str(),
			"detail": self.status.detail,
			"fatal": self.status.fatal,
			"connectedSince": self.status.connected_since.map(unix_ms).unwrap_or(0),
			"lastSuccessful": self.last_successful_connect.map(unix_ms).unwrap_or(0),
			"attempt": self.attempt,
			"currentBackoffMs": self.current_backoff_ms,
			"lastScheduledDelayMs": self.last_scheduled_delay_ms,
			"connects": self.connects,
			"disconnects": self.disconnects,
			"failedAttempts": self.failed_attempts,
		})
	}
}

/// Per-platform connection supervisor.
///
/// One scheduler task owns every platform's state, its retry/stable timers and the
/// in-flight flag; callers talk to it over a command channel and read published
/// snapshots without locking.
pub struct ConnectionManager {
	commands: mpsc::UnboundedSender<Command>,
	/// Arena index of each platform; `views` and the scheduler's slots share it.
	index: HashMap<PlatformId, usize>,
	views: Vec<watch::Receiver<Arc<ConnectionStateSnapshot>>>,
	order: Vec<PlatformId>,
	closed: AtomicBool,
	scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectionManager")
			.field("platforms", &self.order)
			.field("closed", &self.closed.load(Ordering::Relaxed))
			.finish()
	}
}

impl ConnectionManager {
	#[allow(dead_code)]
	pub fn new(registry: Arc<ConnectionRegistry>, bus: EventBus, cfg: ConnectionManagerConfig) -> Result<Self, ConfigError> {
		Self::with_reporter(registry, bus, cfg, Arc::new(TracingErrorReporter))
	}

	/// Build the manager and spawn its scheduler. Nothing connects until [`Self::start`].
	pub fn with_reporter(
		registry: Arc<ConnectionRegistry>,
		bus: EventBus,
		cfg: ConnectionManagerConfig,
		reporter: Arc<dyn ErrorReporter>,
	) -> Result<Self, ConfigError> {
		cfg.validate()?;

		let (commands, commands_rx) = mpsc::unbounded_channel();
		let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
		let publisher = tokio::spawn(run_lifecycle_publisher(bus.clone(), lifecycle_rx));

		let order = registry.platform_ids();
		let initial_backoff_ms = duration_ms(cfg.reconnect.initial_delay);
		let mut views = Vec::with_capacity(order.len());
		let mut slots = Vec::with_capacity(order.len());
		let mut index = HashMap::with_capacity(order.len());
		for (idx, platform) in order.iter().enumerate() {
			let snap = ConnectionStateSnapshot::initial(platform.clone(), initial_backoff_ms);
			let (view, view_rx) = watch::channel(Arc::new(snap.clone()));
			views.push(view_rx);
			index.insert(platform.clone(), idx);
			slots.push(Slot {
				conn: None,
				view,
				snap,
				epoch: 0,
				attempt_epoch: 0,
				in_flight: false,
				stopped: false,
				retry: None,
				stable: None,
				disconnecting: None,
				tasks: Vec::new(),
			});
		}

		let scheduler = Scheduler {
			cfg,
			registry,
			bus,
			reporter,
			commands: commands.clone(),
			lifecycle: lifecycle_tx,
			publisher,
			slots,
			started: false,
			next_token: 0,
		};
		let task = tokio::spawn(scheduler.run(commands_rx));

		Ok(Self {
			commands,
			index,
			views,
			order,
			closed: AtomicBool::new(false),
			scheduler: Mutex::new(Some(task)),
		})
	}

	/// Begin connecting every registered platform. Repeated calls are ignored.
	pub fn start(&self) {
		let _ = self.commands.send(Command::Start);
	}

	#[allow(dead_code)]
	pub fn platforms(&self) -> &[PlatformId] {
		&self.order
	}

	pub fn state(&self, platform: &PlatformId) -> Option<Arc<ConnectionStateSnapshot>> {
		let idx = *self.index.get(platform)?;
		Some(Arc::clone(&self.views[idx].borrow()))
	}

	/// Receiver that observes every snapshot swap for `platform`.
	#[allow(dead_code)]
	pub fn watch(&self, platform: &PlatformId) -> Option<watch::Receiver<Arc<ConnectionStateSnapshot>>> {
		let idx = *self.index.get(platform)?;
		Some(self.views[idx].clone())
	}

	/// Every platform's snapshot, ordered by platform id.
	pub fn summary(&self) -> Vec<Arc<ConnectionStateSnapshot>> {
		self.order.iter().filter_map(|p| self.state(p)).collect()
	}

	/// Clear any failure (including fatal) and reconnect from attempt 0.
	#[allow(dead_code)]
	pub async fn restart(&self, platform: &PlatformId) -> bool {
		self.request(platform, |idx, ack| Command::Restart { idx, ack }).await
	}

	/// Move one platform to DISCONNECTED and cancel its timers.
	#[allow(dead_code)]
	pub async fn disconnect(&self, platform: &PlatformId) -> bool {
		self.request(platform, |idx, ack| Command::Disconnect { idx, ack }).await
	}

	async fn request(&self, platform: &PlatformId, make: impl FnOnce(usize, oneshot::Sender<bool>) -> Command) -> bool {
		let Some(&idx) = self.index.get(platform) else {
			return false;
		};
		let (ack, rx) = oneshot::channel();
		if self.commands.send(make(idx, ack)).is_err() {
			return false;
		}
		rx.await.unwrap_or(false)
	}

	/// Stop scheduling and disconnect every connection. Idempotent.
	pub async fn shutdown(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		let (ack, rx) = oneshot::channel();
		if self.commands.send(Command::Shutdown { ack: Some(ack) }).is_ok() {
			let _ = rx.await;
		}
		let task = self.scheduler.lock().take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}
}

impl Drop for ConnectionManager {
	fn drop(&mut self) {
		if !self.closed.swap(true, Ordering::AcqRel) {
			let _ = self.commands.send(Command::Shutdown { ack: None });
		}
	}
}

enum Outcome {
	Connected,
	Failed {
		detail: String,
		fatal: bool,
		error: anyhow::Error,
	},
}

enum Command {
	Start,
	ConnectFinished { idx: usize, epoch: u64, outcome: Outcome },
	RetryDue { idx: usize, token: u64 },
	StableElapsed { idx: usize, token: u64 },
	StatusChanged { idx: usize, status: ConnectionStatus },
	Restart { idx: usize, ack: oneshot::Sender<bool> },
	Disconnect { idx: usize, ack: oneshot::Sender<bool> },
	Shutdown { ack: Option<oneshot::Sender<()>> },
}

struct Timer {
	token: u64,
	handle: JoinHandle<()>,
}

struct Slot {
	conn: Option<Arc<dyn PlatformConnection>>,
	view: watch::Sender<Arc<ConnectionStateSnapshot>>,
	snap: ConnectionStateSnapshot,
	/// Bumped on disconnect so late connect results are discarded.
	epoch: u64,
	/// Epoch the in-flight connect was started under.
	attempt_epoch: u64,
	in_flight: bool,
	stopped: bool,
	retry: Option<Timer>,
	stable: Option<Timer>,
	disconnecting: Option<JoinHandle<()>>,
	/// Status watcher and event forwarder.
	tasks: Vec<JoinHandle<()>>,
}

impl Slot {
	fn cancel_retry(&mut self) {
		if let Some(t) = self.retry.take() {
			t.handle.abort();
		}
	}

	fn cancel_stable(&mut self) {
		if let Some(t) = self.stable.take() {
			t.handle.abort();
		}
	}

	fn commit(&self) {
		self.view.send_replace(Arc::new(self.snap.clone()));
	}
}

struct Scheduler {
	cfg: ConnectionManagerConfig,
	registry: Arc<ConnectionRegistry>,
	bus: EventBus,
	reporter: Arc<dyn ErrorReporter>,
	commands: mpsc::UnboundedSender<Command>,
	lifecycle: mpsc::UnboundedSender<Event>,
	publisher: JoinHandle<()>,
	slots: Vec<Slot>,
	started: bool,
	next_token: u64,
}

impl Scheduler {
	async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
		let mut summary = self.cfg.summary_interval.map(|period| {
			let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			ticker
		});

		let mut shutdown_ack = None;
		loop {
			let cmd = tokio::select! {
				cmd = rx.recv() => cmd,
				_ = next_tick(&mut summary) => {
					self.publish_summary();
					continue;
				}
			};
			let Some(cmd) = cmd else {
				break;
			};

			match cmd {
				Command::Start => self.start(),
				Command::ConnectFinished { idx, epoch, outcome } => self.on_connect_finished(idx, epoch, outcome),
				Command::RetryDue { idx, token } => self.on_retry_due(idx, token),
				Command::StableElapsed { idx, token } => self.on_stable_elapsed(idx, token),
				Command::StatusChanged { idx, status } => self.on_status_changed(idx, status),
				Command::Restart { idx, ack } => {
					let ok = self.restart(idx);
					let _ = ack.send(ok);
				}
				Command::Disconnect { idx, ack } => {
					self.disconnect(idx, "disconnected");
					let _ = ack.send(true);
				}
				Command::Shutdown { ack } => {
					self.shutdown().await;
					shutdown_ack = ack;
					break;
				}
			}
		}

		let Scheduler {
			lifecycle, publisher, ..
		} = self;
		drop(lifecycle);
		if tokio::time::timeout(LIFECYCLE_DRAIN_TIMEOUT, publisher).await.is_err() {
			warn!("lifecycle events still queued at shutdown; dropping them");
		}
		if let Some(ack) = shutdown_ack {
			let _ = ack.send(());
		}
	}

	fn start(&mut self) {
		if self.started {
			return;
		}
		self.started = true;

		if !self.cfg.connections_enabled {
			info!(platforms = self.slots.len(), "connections globally disabled; not connecting");
			return;
		}
		info!(platforms = self.slots.len(), "connection manager starting");
		for idx in 0..self.slots.len() {
			self.begin_attempt(idx);
		}
	}

	fn transition(&mut self, idx: usize, status: ConnectionStatus) {
		let slot = &mut self.slots[idx];
		slot.snap.status = status;
		slot.commit();
		let ev = status_event(&slot.snap.platform, &slot.snap.status, slot.snap.last_successful_connect);
		let _ = self.lifecycle.send(ev);
	}

	/// Instantiate the connection on first use and attach its watcher and forwarder.
	fn connection(&mut self, idx: usize) -> Option<Arc<dyn PlatformConnection>> {
		if let Some(conn) = &self.slots[idx].conn {
			return Some(Arc::clone(conn));
		}

		let platform = self.slots[idx].snap.platform.clone();
		let Some(conn) = self.registry.get(&platform) else {
			warn!(%platform, "platform has no connection provider");
			return None;
		};

		let watcher = tokio::spawn(watch_status(idx, conn.subscribe_status(), self.commands.clone()));
		let forwarder = tokio::spawn(forward_events(platform, Arc::clone(&conn), self.bus.clone()));

		let slot = &mut self.slots[idx];
		slot.tasks.push(watcher);
		slot.tasks.push(forwarder);
		slot.conn = Some(Arc::clone(&conn));
		Some(conn)
	}

	fn begin_attempt(&mut self, idx: usize) {
		if self.slots[idx].in_flight {
			debug!(platform = %self.slots[idx].snap.platform, "connect already in flight");
			return;
		}
		let Some(conn) = self.connection(idx) else {
			return;
		};

		let slot = &mut self.slots[idx];
		slot.cancel_retry();
		slot.stopped = false;
		slot.in_flight = true;
		let epoch = slot.epoch;
		slot.attempt_epoch = epoch;
		let attempt = slot.snap.attempt;
		let pending_disconnect = slot.disconnecting.take();

		self.transition(idx, ConnectionStatus::connecting(format!("attempt {attempt}")));

		let commands = self.commands.clone();
		tokio::spawn(async move {
			if let Some(pending) = pending_disconnect {
				let _ = pending.await;
			}
			let outcome = match AssertUnwindSafe(conn.connect()).catch_unwind().await {
				Ok(Ok(())) => Outcome::Connected,
				Ok(Err(e)) => Outcome::Failed {
					detail: e.detail().to_string(),
					fatal: e.is_fatal(),
					error: anyhow::Error::new(e),
				},
				Err(panic) => Outcome::Failed {
					detail: "connect.panicked".to_string(),
					fatal: false,
					error: panic_error(panic),
				},
			};
			let _ = commands.send(Command::ConnectFinished { idx, epoch, outcome });
		});
	}

	fn on_connect_finished(&mut self, idx: usize, epoch: u64, outcome: Outcome) {
		let slot = &mut self.slots[idx];
		slot.in_flight = false;

		if slot.epoch != epoch || slot.stopped {
			debug!(platform = %slot.snap.platform, "discarding connect result after disconnect");
			if matches!(outcome, Outcome::Connected)
				&& let Some(conn) = slot.conn.clone()
			{
				slot.disconnecting = Some(tokio::spawn(async move { conn.disconnect().await }));
			}
			return;
		}

		// A status change seen while the attempt was in flight was ignored; recheck it.
		let dropped = slot
			.conn
			.as_ref()
			.map(|c| c.status())
			.filter(|st| matches!(st.state, ConnectionState::Failed | ConnectionState::Disconnected));

		match outcome {
			Outcome::Connected => match dropped {
				Some(st) => {
					debug!(platform = %slot.snap.platform, detail = %st.detail, "stream dropped before connect result");
					self.on_failure(idx, st.detail, st.fatal);
				}
				None => self.on_connected(idx),
			},
			Outcome::Failed { detail, fatal, error } => {
				self.reporter.report("manager.connect", &error);
				self.on_failure(idx, detail, fatal);
			}
		}
	}

	fn on_connected(&mut self, idx: usize) {
		let now = SystemTime::now();
		let stable_reset = self.cfg.reconnect.stable_reset;
		self.next_token += 1;
		let token = self.next_token;
		let commands = self.commands.clone();

		let slot = &mut self.slots[idx];
		slot.cancel_retry();
		if slot.snap.status.is_connected() {
			return;
		}
		slot.cancel_stable();

		let status = match slot.conn.as_ref().map(|c| c.status()) {
			Some(st) if st.is_connected() => st,
			_ => ConnectionStatus::connected("connected", now),
		};
		slot.snap.connects += 1;
		slot.snap.last_successful_connect = Some(now);
		slot.stable = Some(Timer {
			token,
			handle: spawn_timer(commands, stable_reset, Command::StableElapsed { idx, token }),
		});

		let platform = slot.snap.platform.clone();
		let attempt = slot.snap.attempt;
		metrics::counter!("streamhub_connection_connects_total", "platform" => platform.to_string()).increment(1);
		metrics::gauge!("streamhub_connection_connected", "platform" => platform.to_string()).set(1.0);
		info!(%platform, attempt, "platform connected");

		self.transition(idx, status);
	}

	fn on_failure(&mut self, idx: usize, detail: String, fatal: bool) {
		let policy = self.cfg.reconnect;
		let slot = &mut self.slots[idx];
		let platform = slot.snap.platform.clone();

		slot.cancel_stable();
		slot.cancel_retry();
		slot.snap.failed_attempts += 1;
		if slot.snap.status.is_connected() {
			slot.snap.disconnects += 1;
			metrics::gauge!("streamhub_connection_connected", "platform" => platform.to_string()).set(0.0);
		}
		metrics::counter!(
			"streamhub_connection_failures_total",
			"platform" => platform.to_string(),
			"fatal" => fatal.to_string()
		)
		.increment(1);

		if fatal {
			warn!(%platform, %detail, "fatal connection failure; not retrying");
			self.transition(idx, ConnectionStatus::failed(detail, true));
			return;
		}

		slot.snap.attempt = slot.snap.attempt.saturating_add(1);
		let attempt = slot.snap.attempt;
		if policy.exhausted(attempt) {
			warn!(%platform, %detail, attempt, max_attempts = policy.max_attempts, "reconnect attempts exhausted");
			self.transition(idx, ConnectionStatus::failed(DETAIL_EXHAUSTED, true));
			return;
		}

		let base = policy.delay(attempt);
		let delay = policy.jittered(base);
		slot.snap.current_backoff_ms = duration_ms(base);
		slot.snap.last_scheduled_delay_ms = duration_ms(delay);

		self.next_token += 1;
		let token = self.next_token;
		let handle = spawn_timer(self.commands.clone(), delay, Command::RetryDue { idx, token });
		self.slots[idx].retry = Some(Timer { token, handle });

		let delay_ms = duration_ms(delay);
		debug!(%platform, %detail, attempt, delay_ms, "transient failure; retry scheduled");
		self.transition(idx, ConnectionStatus::failed(detail, false));
		self.transition(idx, ConnectionStatus::reconnect_scheduled(format!("retry in {delay_ms}ms")));
	}

	fn on_retry_due(&mut self, idx: usize, token: u64) {
		let slot = &mut self.slots[idx];
		if slot.retry.as_ref().is_none_or(|t| t.token != token) {
			return;
		}
		slot.retry = None;
		self.begin_attempt(idx);
	}

	fn on_stable_elapsed(&mut self, idx: usize, token: u64) {
		let slot = &mut self.slots[idx];
		if slot.stable.as_ref().is_none_or(|t| t.token != token) {
			return;
		}
		slot.stable = None;
		if !slot.snap.status.is_connected() {
			return;
		}
		slot.snap.attempt = 0;
		slot.snap.current_backoff_ms = duration_ms(self.cfg.reconnect.initial_delay);
		slot.snap.last_scheduled_delay_ms = 0;
		slot.commit();
		debug!(platform = %slot.snap.platform, "connection stable; backoff reset");
	}

	/// Status reported by the connection itself (heartbeat loss, remote close, local resume).
	fn on_status_changed(&mut self, idx: usize, status: ConnectionStatus) {
		let slot = &self.slots[idx];
		if slot.stopped || slot.in_flight || !self.started {
			return;
		}
		let current = slot.snap.status.state;

		match status.state {
			ConnectionState::Connected if current != ConnectionState::Connected => {
				info!(platform = %slot.snap.platform, "adopting connection-local resume");
				self.on_connected(idx);
			}
			ConnectionState::Failed | ConnectionState::Disconnected if current == ConnectionState::Connected => {
				self.on_failure(idx, status.detail, status.fatal);
			}
			_ => {}
		}
	}

	fn restart(&mut self, idx: usize) -> bool {
		if !self.cfg.connections_enabled {
			warn!(platform = %self.slots[idx].snap.platform, "restart ignored; connections globally disabled");
			return false;
		}
		self.started = true;

		let slot = &mut self.slots[idx];
		slot.cancel_retry();
		slot.cancel_stable();
		slot.stopped = false;
		slot.snap.attempt = 0;
		slot.snap.current_backoff_ms = duration_ms(self.cfg.reconnect.initial_delay);
		slot.snap.last_scheduled_delay_ms = 0;
		info!(platform = %slot.snap.platform, "restarting platform connection");

		if slot.snap.status.is_connected() || slot.in_flight {
			// The running attempt now counts for the restart.
			slot.epoch = slot.attempt_epoch;
			slot.commit();
			return true;
		}
		self.begin_attempt(idx);
		true
	}

	fn disconnect(&mut self, idx: usize, detail: &str) {
		let slot = &mut self.slots[idx];
		slot.stopped = true;
		slot.epoch += 1;
		slot.cancel_retry();
		slot.cancel_stable();

		let platform = slot.snap.platform.clone();
		if slot.snap.status.is_connected() {
			slot.snap.disconnects += 1;
			metrics::gauge!("streamhub_connection_connected", "platform" => platform.to_string()).set(0.0);
		}
		if let Some(conn) = slot.conn.clone() {
			slot.disconnecting = Some(tokio::spawn(async move { conn.disconnect().await }));
		}

		if slot.snap.status.state != ConnectionState::Disconnected {
			info!(%platform, detail, "platform disconnected");
			self.transition(idx, ConnectionStatus::disconnected(detail));
		}
	}

	async fn shutdown(&mut self) {
		for idx in 0..self.slots.len() {
			self.disconnect(idx, "shutdown");
			for task in self.slots[idx].tasks.drain(..) {
				task.abort();
			}
		}

		for slot in &mut self.slots {
			if let Some(pending) = slot.disconnecting.take()
				&& let Err(e) = pending.await
				&& e.is_panic()
			{
				self.reporter
					.report("manager.disconnect", &panic_error(e.into_panic()));
			}
		}
		info!("connection manager stopped");
	}

	fn publish_summary(&self) {
		let connected = self.slots.iter().filter(|s| s.snap.status.is_connected()).count();
		info!(platforms = self.slots.len(), connected, "connection summary");
		for slot in &self.slots {
			debug!(
				platform = %slot.snap.platform,
				state = %slot.snap.status.state,
				detail = %slot.snap.status.detail,
				attempt = slot.snap.attempt,
				failed_attempts = slot.snap.failed_attempts,
				"platform status"
			);
		}

		let entries = self.slots.iter().map(|s| s.snap.to_json()).collect();
		let mut payload = Payload::new();
		payload.insert(SUMMARY_KEY.to_string(), serde_json::Value::Array(entries));
		let _ = self
			.lifecycle
			.send(Event::new(EventType::System, PlatformId::system(), payload));
	}
}

fn duration_ms(d: Duration) -> u64 {
	u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn spawn_timer(commands: mpsc::UnboundedSender<Command>, delay: Duration, cmd: Command) -> JoinHandle<()> {
	tokio::spawn(async move {
		tokio::time::sleep(delay).await;
		let _ = commands.send(cmd);
	})
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
	match ticker {
		Some(t) => {
			t.tick().await;
		}
		None => std::future::pending().await,
	}
}

/// Publishes lifecycle events one at a time so the bus sees them in transition order.
async fn run_lifecycle_publisher(bus: EventBus, mut rx: mpsc::UnboundedReceiver<Event>) {
	while let Some(ev) = rx.recv().await {
		bus.publish(ev).await;
	}
}

async fn watch_status(idx: usize, mut rx: watch::Receiver<ConnectionStatus>, commands: mpsc::UnboundedSender<Command>) {
	rx.borrow_and_update();
	while rx.changed().await.is_ok() {
		let status = rx.borrow_and_update().clone();
		if commands.send(Command::StatusChanged { idx, status }).is_err() {
			break;
		}
	}
}

async fn forward_events(platform: PlatformId, conn: Arc<dyn PlatformConnection>, bus: EventBus) {
	let mut rx = conn.subscribe_events();
	drop(conn);
	loop {
		match rx.recv().await {
			Ok(ev) => bus.publish(ev).await,
			Err(RecvError::Lagged(n)) => {
				metrics::counter!("streamhub_connection_forward_lagged_total", "platform" => platform.to_string())
					.increment(n);
				warn!(%platform, skipped = n, "event forwarder lagged");
			}
			Err(RecvError::Closed) => {
				debug!(%platform, "connection event stream closed; forwarder exiting");
				break;
			}
		}
	}
}
