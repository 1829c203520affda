#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use streamhub_domain::{ConnectionState, ConnectionStatus, Event, PlatformId};
use streamhub_util::endpoint::StreamEndpoint;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credentials::{CredentialError, CredentialProvider};
use crate::eventsub::MessageDecoder;
use crate::transport::{StreamingTransport, TransportError, TransportEvent, WsConnector};

/// Status detail used when the heartbeat watchdog fires.
pub const DETAIL_HEARTBEAT_TIMEOUT: &str = "heartbeat.timeout";
/// Status detail used when the remote side drops the stream.
pub const DETAIL_TRANSPORT_CLOSED: &str = "transport.closed";

/// Failure of a connect attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
	#[error("platform {0} is disabled")]
	Disabled(PlatformId),

	#[error("a connect attempt is already in flight")]
	InFlight,

	#[error(transparent)]
	Credential(#[from] CredentialError),

	#[error(transparent)]
	Transport(#[from] TransportError),

	#[error("stream closed before the connection was established")]
	ClosedDuringConnect,
}

impl ConnectError {
	/// Fatal errors are not retried automatically.
	pub fn is_fatal(&self) -> bool {
		match self {
			Self::Disabled(_) => true,
			Self::Credential(e) => e.is_fatal(),
			Self::InFlight | Self::Transport(_) | Self::ClosedDuringConnect => false,
		}
	}

	/// Short machine-readable tag identifying the failure class.
	pub fn detail(&self) -> &'static str {
		match self {
			Self::Disabled(_) => "platform.disabled",
			Self::InFlight => "connect.in_flight",
			Self::Credential(e) => e.detail(),
			Self::Transport(TransportError::InvalidHeartbeat(_)) => "transport.invalid_heartbeat",
			Self::Transport(TransportError::Handshake(_)) => "transport.handshake",
			Self::Transport(TransportError::NotOpen) => "transport.not_open",
			Self::ClosedDuringConnect => DETAIL_TRANSPORT_CLOSED,
		}
	}
}

/// A named platform's connection, driven by the connection manager.
#[async_trait::async_trait]
pub trait PlatformConnection: Send + Sync + 'static {
	fn platform(&self) -> &PlatformId;

	/// Connect. Succeeds immediately when already connected; fails immediately
	/// with [`ConnectError::InFlight`] while another attempt is running.
	async fn connect(&self) -> Result<(), ConnectError>;

	/// Close the stream and move to DISCONNECTED. Idempotent.
	async fn disconnect(&self);

	fn status(&self) -> ConnectionStatus;

	fn is_connected(&self) -> bool {
		self.status().is_connected()
	}

	/// Administrative enable flag.
	fn is_enabled(&self) -> bool;

	fn set_enabled(&self, enabled: bool);

	/// Status change feed.
	fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus>;

	/// Mapped platform events.
	fn subscribe_events(&self) -> broadcast::Receiver<Event>;
}

/// Settings for a [`StreamConnection`].
#[derive(Debug, Clone)]
pub struct StreamConnectionConfig {
	pub platform: PlatformId,
	pub endpoint: StreamEndpoint,
	pub heartbeat_interval: Duration,
	/// Delay before the local resume after a heartbeat timeout.
	pub resume_delay: Duration,
	pub enabled: bool,
	pub events_capacity: usize,
}

impl StreamConnectionConfig {
	pub fn new(platform: PlatformId, endpoint: StreamEndpoint) -> Self {
		Self {
			platform,
			endpoint,
			heartbeat_interval: Duration::from_secs(10),
			resume_delay: Duration::from_secs(2),
			enabled: true,
			events_capacity: 4096,
		}
	}
}

/// [`PlatformConnection`] over a [`StreamingTransport`].
#[derive(Clone)]
pub struct StreamConnection {
	inner: Arc<Inner>,
}

struct Inner {
	cfg: StreamConnectionConfig,
	credentials: Arc<dyn CredentialProvider>,
	decoder: Arc<dyn MessageDecoder>,
	transport: StreamingTransport,
	enabled: AtomicBool,
	in_flight: AtomicBool,
	status_tx: watch::Sender<ConnectionStatus>,
	events_tx: broadcast::Sender<Event>,
	pump: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the in-flight flag when the attempt ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

impl StreamConnection {
	pub fn new(
		cfg: StreamConnectionConfig,
		credentials: Arc<dyn CredentialProvider>,
		decoder: Arc<dyn MessageDecoder>,
	) -> Self {
		let transport = StreamingTransport::new(Arc::clone(&decoder));
		Self::with_transport(cfg, credentials, decoder, transport)
	}

	pub fn with_connector(
		cfg: StreamConnectionConfig,
		credentials: Arc<dyn CredentialProvider>,
		decoder: Arc<dyn MessageDecoder>,
		connector: WsConnector,
	) -> Self {
		let transport = StreamingTransport::with_connector(Arc::clone(&decoder), connector);
		Self::with_transport(cfg, credentials, decoder, transport)
	}

	fn with_transport(
		cfg: StreamConnectionConfig,
		credentials: Arc<dyn CredentialProvider>,
		decoder: Arc<dyn MessageDecoder>,
		transport: StreamingTransport,
	) -> Self {
		let (status_tx, _) = watch::channel(ConnectionStatus::disconnected("initial"));
		let (events_tx, _) = broadcast::channel(cfg.events_capacity.max(1));
		let enabled = AtomicBool::new(cfg.enabled);
		Self {
			inner: Arc::new(Inner {
				cfg,
				credentials,
				decoder,
				transport,
				enabled,
				in_flight: AtomicBool::new(false),
				status_tx,
				events_tx,
				pump: Mutex::new(None),
			}),
		}
	}

	pub fn config(&self) -> &StreamConnectionConfig {
		&self.inner.cfg
	}

	/// Send a text frame on the open stream.
	pub async fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
		self.inner.transport.send(text).await
	}

	/// Feed a transport notification as if the stream had produced it.
	pub fn inject_transport_event(&self, ev: TransportEvent) {
		Inner::on_transport_event(&self.inner, ev);
	}
}

impl Inner {
	fn set_status(&self, status: ConnectionStatus) {
		debug!(
			platform = %self.cfg.platform,
			state = %status.state,
			detail = %status.detail,
			"connection status"
		);
		self.status_tx.send_replace(status);
	}

	fn status(&self) -> ConnectionStatus {
		self.status_tx.borrow().clone()
	}

	fn ensure_pump(self: &Arc<Self>) {
		let mut pump = self.pump.lock();
		if pump.as_ref().is_some_and(|h| !h.is_finished()) {
			return;
		}

		let rx = self.transport.subscribe();
		let weak = Arc::downgrade(self);
		*pump = Some(tokio::spawn(run_pump(weak, rx)));
	}

	async fn connect(self: &Arc<Self>) -> Result<(), ConnectError> {
		if self.status().is_connected() && self.transport.is_open() {
			return Ok(());
		}

		if self
			.in_flight
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return Err(ConnectError::InFlight);
		}
		let _guard = InFlightGuard(&self.in_flight);

		let platform = &self.cfg.platform;

		if !self.enabled.load(Ordering::Acquire) {
			let err = ConnectError::Disabled(platform.clone());
			self.set_status(ConnectionStatus::failed(err.detail(), true));
			return Err(err);
		}

		self.set_status(ConnectionStatus::connecting("connect"));
		self.ensure_pump();

		let result = async {
			let credential = self.credentials.ensure_valid().await?;
			self.transport
				.connect(&self.cfg.endpoint, self.cfg.heartbeat_interval, Some(&credential))
				.await?;
			Ok::<(), ConnectError>(())
		}
		.await;

		match result {
			Ok(()) => {
				// Checked under the status lock so a close racing the handshake is
				// either seen here or handled by the pump after CONNECTED is visible.
				let published = self.status_tx.send_if_modified(|status| {
					if !self.transport.is_open() {
						return false;
					}
					*status = ConnectionStatus::connected("connected", SystemTime::now());
					true
				});
				if published {
					info!(%platform, endpoint = %self.cfg.endpoint, "platform connected");
					return Ok(());
				}

				self.transport.close();
				let err = ConnectError::ClosedDuringConnect;
				warn!(%platform, error = %err, "platform connect failed");
				self.set_status(ConnectionStatus::failed(err.detail(), false));
				Err(err)
			}
			Err(e) => {
				self.transport.close();
				warn!(%platform, error = %e, fatal = e.is_fatal(), "platform connect failed");
				self.set_status(ConnectionStatus::failed(e.detail(), e.is_fatal()));
				Err(e)
			}
		}
	}

	async fn disconnect(&self) {
		self.transport.close();
		self.set_status(ConnectionStatus::disconnected("disconnect"));
		info!(platform = %self.cfg.platform, "platform disconnected");
	}

	fn on_transport_event(self: &Arc<Self>, ev: TransportEvent) {
		match ev {
			TransportEvent::Message(msg) => {
				if let Some(event) = self.decoder.to_event(&self.cfg.platform, &msg) {
					let _ = self.events_tx.send(event);
				}
			}
			TransportEvent::Closed { reason } => {
				let failed = self.status_tx.send_if_modified(|status| {
					if !status.is_connected() {
						return false;
					}
					*status = ConnectionStatus::failed(DETAIL_TRANSPORT_CLOSED, false);
					true
				});
				if failed {
					warn!(platform = %self.cfg.platform, %reason, "stream closed unexpectedly");
				}
			}
			TransportEvent::HeartbeatTimeout { silent_for } => {
				warn!(
					platform = %self.cfg.platform,
					silent_ms = silent_for.as_millis() as u64,
					"heartbeat timeout; closing stream"
				);
				self.transport.close();
				self.set_status(ConnectionStatus::failed(DETAIL_HEARTBEAT_TIMEOUT, false));
				self.schedule_resume();
			}
		}
	}

	/// One local resume attempt after `resume_delay`, if still enabled and FAILED.
	fn schedule_resume(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		let delay = self.cfg.resume_delay;
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let Some(inner) = weak.upgrade() else {
				return;
			};

			let status = inner.status();
			if !inner.enabled.load(Ordering::Acquire) || status.state != ConnectionState::Failed {
				debug!(platform = %inner.cfg.platform, state = %status.state, "skipping heartbeat resume");
				return;
			}

			info!(platform = %inner.cfg.platform, "resuming after heartbeat timeout");
			if let Err(e) = inner.connect().await {
				debug!(platform = %inner.cfg.platform, error = %e, "heartbeat resume failed");
			}
		});
	}
}

async fn run_pump(weak: Weak<Inner>, mut rx: broadcast::Receiver<TransportEvent>) {
	loop {
		let ev = match rx.recv().await {
			Ok(ev) => ev,
			Err(broadcast::error::RecvError::Lagged(n)) => {
				metrics::counter!("streamhub_connection_lagged_frames_total").increment(n);
				continue;
			}
			Err(broadcast::error::RecvError::Closed) => break,
		};

		let Some(inner) = weak.upgrade() else {
			break;
		};
		Inner::on_transport_event(&inner, ev);
	}
}

#[async_trait::async_trait]
impl PlatformConnection for StreamConnection {
	fn platform(&self) -> &PlatformId {
		&self.inner.cfg.platform
	}

	async fn connect(&self) -> Result<(), ConnectError> {
		self.inner.connect().await
	}

	async fn disconnect(&self) {
		self.inner.disconnect().await
	}

	fn status(&self) -> ConnectionStatus {
		self.inner.status()
	}

	fn is_enabled(&self) -> bool {
		self.inner.enabled.load(Ordering::Acquire)
	}

	fn set_enabled(&self, enabled: bool) {
		self.inner.enabled.store(enabled, Ordering::Release);
	}

	fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
		self.inner.status_tx.subscribe()
	}

	fn subscribe_events(&self) -> broadcast::Receiver<Event> {
		self.inner.events_tx.subscribe()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use futures_util::{SinkExt, StreamExt};
	use streamhub_domain::EventType;
	use tokio::net::TcpListener;
	use tokio::time::timeout;
	use tokio_tungstenite::tungstenite::protocol::Message;

	use super::*;
	use crate::SecretString;
	use crate::credentials::StaticCredentialProvider;
	use crate::eventsub::EventSubDecoder;
	use crate::transport::{BoxFuture, ConnectRequest, WsStream};

	const NOTIFICATION: &str = r#"{"metadata":{"message_id":"n1","message_type":"notification","subscription_type":"channel.raid"},"payload":{"event":{"from_broadcaster_user_id":"7","viewers":12}}}"#;

	fn platform() -> PlatformId {
		PlatformId::new("twitch").unwrap()
	}

	fn token() -> Arc<dyn CredentialProvider> {
		Arc::new(StaticCredentialProvider::new(Some(SecretString::new("tok"))))
	}

	fn config(endpoint: StreamEndpoint) -> StreamConnectionConfig {
		let mut cfg = StreamConnectionConfig::new(platform(), endpoint);
		cfg.heartbeat_interval = Duration::from_secs(10);
		cfg
	}

	fn unreachable_endpoint() -> StreamEndpoint {
		StreamEndpoint::parse("ws://127.0.0.1:9/ws").unwrap()
	}

	fn refusing_connector(calls: Arc<AtomicUsize>) -> WsConnector {
		Arc::new(move |_req: ConnectRequest| {
			calls.fetch_add(1, Ordering::SeqCst);
			Box::pin(async { Err(anyhow::anyhow!("connection refused")) }) as BoxFuture<'static, anyhow::Result<WsStream>>
		})
	}

	fn hanging_connector() -> WsConnector {
		Arc::new(|_req: ConnectRequest| {
			Box::pin(async {
				futures_util::future::pending::<()>().await;
				Err(anyhow::anyhow!("unreachable"))
			}) as BoxFuture<'static, anyhow::Result<WsStream>>
		})
	}

	/// Accepts one websocket; replies to the first client text frame with `reply`, then closes.
	async fn spawn_server(reply: Option<&'static str>) -> StreamEndpoint {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");
		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.expect("accept");
			let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws accept");
			while let Some(Ok(msg)) = ws.next().await {
				if msg.is_text() {
					match reply {
						Some(text) => ws.send(Message::text(text)).await.expect("reply"),
						None => {
							let _ = ws.close(None).await;
							break;
						}
					}
				}
			}
		});
		StreamEndpoint::parse(&format!("ws://{addr}/ws")).expect("endpoint")
	}

	/// Accepts every websocket and closes it right after the handshake.
	async fn spawn_closing_server() -> StreamEndpoint {
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");
		tokio::spawn(async move {
			while let Ok((stream, _)) = listener.accept().await {
				tokio::spawn(async move {
					if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
						let _ = ws.close(None).await;
					}
				});
			}
		});
		StreamEndpoint::parse(&format!("ws://{addr}/ws")).expect("endpoint")
	}

	async fn wait_for(
		rx: &mut watch::Receiver<ConnectionStatus>,
		pred: impl FnMut(&ConnectionStatus) -> bool,
	) -> ConnectionStatus {
		timeout(Duration::from_secs(30), rx.wait_for(pred))
			.await
			.expect("status within timeout")
			.expect("status sender alive")
			.clone()
	}

	#[tokio::test]
	async fn disabled_platform_fails_fatally() {
		let mut cfg = config(unreachable_endpoint());
		cfg.enabled = false;
		let conn = StreamConnection::new(cfg, token(), Arc::new(EventSubDecoder::new()));

		let err = conn.connect().await.unwrap_err();
		assert!(matches!(err, ConnectError::Disabled(_)));
		assert!(err.is_fatal());

		let status = conn.status();
		assert_eq!(status.state, ConnectionState::Failed);
		assert!(status.fatal);
		assert_eq!(status.detail, "platform.disabled");
	}

	#[tokio::test]
	async fn credential_errors_carry_their_fatality() {
		let conn = StreamConnection::new(
			config(unreachable_endpoint()),
			Arc::new(StaticCredentialProvider::new(None)),
			Arc::new(EventSubDecoder::new()),
		);
		let err = conn.connect().await.unwrap_err();
		assert!(!err.is_fatal());
		assert_eq!(conn.status().detail, "credential.unavailable");

		let expired = StaticCredentialProvider::with_expiry(SecretString::new("old"), SystemTime::now() - Duration::from_secs(1));
		let conn = StreamConnection::new(config(unreachable_endpoint()), Arc::new(expired), Arc::new(EventSubDecoder::new()));
		let err = conn.connect().await.unwrap_err();
		assert!(err.is_fatal());
		assert!(conn.status().is_fatal());
		assert_eq!(conn.status().detail, "credential.expired");
	}

	#[tokio::test]
	async fn handshake_failure_is_transient() {
		let calls = Arc::new(AtomicUsize::new(0));
		let conn = StreamConnection::with_connector(
			config(unreachable_endpoint()),
			token(),
			Arc::new(EventSubDecoder::new()),
			refusing_connector(Arc::clone(&calls)),
		);

		let err = conn.connect().await.unwrap_err();
		assert!(!err.is_fatal());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		let status = conn.status();
		assert_eq!(status.state, ConnectionState::Failed);
		assert_eq!(status.detail, "transport.handshake");
		assert!(!status.fatal);
	}

	#[tokio::test]
	async fn concurrent_connect_is_rejected_while_in_flight() {
		let conn = StreamConnection::with_connector(
			config(unreachable_endpoint()),
			token(),
			Arc::new(EventSubDecoder::new()),
			hanging_connector(),
		);
		let mut status_rx = conn.subscribe_status();

		let first = {
			let conn = conn.clone();
			tokio::spawn(async move { conn.connect().await })
		};
		wait_for(&mut status_rx, |s| s.state == ConnectionState::Connecting).await;

		let err = conn.connect().await.unwrap_err();
		assert!(matches!(err, ConnectError::InFlight));
		assert!(!err.is_fatal());

		first.abort();
	}

	#[tokio::test]
	async fn connects_maps_events_and_is_idempotent() {
		let endpoint = spawn_server(Some(NOTIFICATION)).await;
		let conn = StreamConnection::new(config(endpoint), token(), Arc::new(EventSubDecoder::new()));
		let mut events = conn.subscribe_events();

		conn.connect().await.expect("connect");
		assert!(conn.is_connected());
		let since = conn.status().connected_since;
		assert!(since.is_some());

		conn.connect().await.expect("second connect is a no-op");
		assert_eq!(conn.status().connected_since, since);

		conn.send("hello").await.expect("send");
		let event = timeout(Duration::from_secs(10), events.recv())
			.await
			.expect("event in time")
			.expect("events channel open");
		assert_eq!(event.kind, EventType::Raid);
		assert_eq!(event.platform, platform());
		assert_eq!(event.payload_i64("viewers"), Some(12));

		conn.disconnect().await;
		assert_eq!(conn.status().state, ConnectionState::Disconnected);
		assert!(!conn.is_connected());
	}

	#[tokio::test]
	async fn remote_close_marks_the_connection_failed() {
		let endpoint = spawn_server(None).await;
		let conn = StreamConnection::new(config(endpoint), token(), Arc::new(EventSubDecoder::new()));
		let mut status_rx = conn.subscribe_status();

		conn.connect().await.expect("connect");
		conn.send("bye").await.expect("send");

		let status = wait_for(&mut status_rx, |s| s.state == ConnectionState::Failed).await;
		assert_eq!(status.detail, DETAIL_TRANSPORT_CLOSED);
		assert!(!status.fatal);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn close_right_after_handshake_never_leaves_a_dead_connection_connected() {
		let endpoint = spawn_closing_server().await;

		for _ in 0..25 {
			let conn = StreamConnection::new(config(endpoint.clone()), token(), Arc::new(EventSubDecoder::new()));
			let mut status_rx = conn.subscribe_status();

			match conn.connect().await {
				Ok(()) => {}
				Err(e) => {
					assert!(matches!(e, ConnectError::ClosedDuringConnect), "{e}");
					assert!(!e.is_fatal());
				}
			}

			let status = wait_for(&mut status_rx, |s| s.state == ConnectionState::Failed).await;
			assert_eq!(status.detail, DETAIL_TRANSPORT_CLOSED);
			assert!(!status.fatal);
			assert!(!conn.is_connected());
			assert!(!conn.inner.transport.is_open());
		}
	}

	#[tokio::test(start_paused = true)]
	async fn heartbeat_timeout_fails_then_resumes() {
		let calls = Arc::new(AtomicUsize::new(0));
		let mut cfg = config(unreachable_endpoint());
		cfg.resume_delay = Duration::from_secs(2);
		let conn = StreamConnection::with_connector(cfg, token(), Arc::new(EventSubDecoder::new()), refusing_connector(Arc::clone(&calls)));
		let mut status_rx = conn.subscribe_status();

		conn.inject_transport_event(TransportEvent::HeartbeatTimeout {
			silent_for: Duration::from_secs(21),
		});
		let status = conn.status();
		assert_eq!(status.state, ConnectionState::Failed);
		assert_eq!(status.detail, DETAIL_HEARTBEAT_TIMEOUT);
		assert!(!status.fatal);
		assert_eq!(calls.load(Ordering::SeqCst), 0);

		let status = wait_for(&mut status_rx, |s| s.detail == "transport.handshake").await;
		assert_eq!(status.state, ConnectionState::Failed);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn heartbeat_resume_is_skipped_once_disabled() {
		let calls = Arc::new(AtomicUsize::new(0));
		let mut cfg = config(unreachable_endpoint());
		cfg.resume_delay = Duration::from_secs(2);
		let conn = StreamConnection::with_connector(cfg, token(), Arc::new(EventSubDecoder::new()), refusing_connector(Arc::clone(&calls)));

		conn.inject_transport_event(TransportEvent::HeartbeatTimeout {
			silent_for: Duration::from_secs(21),
		});
		conn.set_enabled(false);

		tokio::time::sleep(Duration::from_secs(5)).await;
		assert_eq!(calls.load(Ordering::SeqCst), 0);
		assert_eq!(conn.status().detail, DETAIL_HEARTBEAT_TIMEOUT);
	}
}
