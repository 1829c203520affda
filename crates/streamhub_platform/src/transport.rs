#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use streamhub_util::endpoint::StreamEndpoint;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::credentials::Credential;
use crate::eventsub::{DecodedMessage, MessageDecoder};
use crate::{SecretString, new_session_id};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(ConnectRequest) -> BoxFuture<'static, anyhow::Result<WsStream>> + Send + Sync>;

/// Lower bound for the silence window.
pub const MIN_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

const OUTBOUND_QUEUE_CAPACITY: usize = 64;
const EVENTS_CAPACITY: usize = 1024;

/// Silence window after which a stream is declared dead: `max(5s, 2 × interval)`.
pub fn heartbeat_timeout(interval: Duration) -> Duration {
	interval.saturating_mul(2).max(MIN_HEARTBEAT_TIMEOUT)
}

/// Handshake request handed to a [`WsConnector`].
#[derive(Debug, Clone)]
pub struct ConnectRequest {
	pub url: Url,
	pub bearer: Option<SecretString>,
}

/// Notifications emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
	Message(DecodedMessage),

	/// The remote side closed the stream or the stream failed.
	Closed {
		reason: String,
	},

	/// No heartbeat within the silence window.
	HeartbeatTimeout {
		silent_for: Duration,
	},
}

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("heartbeat interval must be at least 1s (got {0:?})")]
	InvalidHeartbeat(Duration),

	#[error("websocket handshake failed: {0:#}")]
	Handshake(anyhow::Error),

	#[error("transport is not open")]
	NotOpen,
}

/// Detects silence on a stream. Fires at most once per episode.
#[derive(Debug)]
pub struct HeartbeatWatchdog {
	timeout: Duration,
	last: Mutex<Instant>,
	fired: AtomicBool,
}

impl HeartbeatWatchdog {
	pub fn new(interval: Duration) -> Self {
		Self {
			timeout: heartbeat_timeout(interval),
			last: Mutex::new(Instant::now()),
			fired: AtomicBool::new(false),
		}
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Record a heartbeat.
	pub fn touch(&self) {
		*self.last.lock() = Instant::now();
	}

	/// Returns the silent duration the first time the window is exceeded.
	pub fn check(&self, now: Instant) -> Option<Duration> {
		if self.fired.load(Ordering::Acquire) {
			return None;
		}

		let silent = now.saturating_duration_since(*self.last.lock());
		if silent > self.timeout && !self.fired.swap(true, Ordering::AcqRel) {
			return Some(silent);
		}
		None
	}
}

struct Session {
	id: String,
	outbound: mpsc::Sender<Message>,
	open: Arc<AtomicBool>,
	reader: JoinHandle<()>,
	watchdog: JoinHandle<()>,
}

impl Drop for Session {
	fn drop(&mut self) {
		self.open.store(false, Ordering::Release);
		self.reader.abort();
		self.watchdog.abort();
	}
}

/// One long-lived duplex websocket stream with a heartbeat watchdog.
pub struct StreamingTransport {
	decoder: Arc<dyn MessageDecoder>,
	connector: WsConnector,
	events_tx: broadcast::Sender<TransportEvent>,
	session: Mutex<Option<Session>>,
}

impl StreamingTransport {
	pub fn new(decoder: Arc<dyn MessageDecoder>) -> Self {
		Self::with_connector(decoder, default_connector())
	}

	pub fn with_connector(decoder: Arc<dyn MessageDecoder>, connector: WsConnector) -> Self {
		let (events_tx, _) = broadcast::channel(EVENTS_CAPACITY);
		Self {
			decoder,
			connector,
			events_tx,
			session: Mutex::new(None),
		}
	}

	/// Register for decoded messages, close and heartbeat-timeout notifications.
	pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
		self.events_tx.subscribe()
	}

	pub fn is_open(&self) -> bool {
		self.session
			.lock()
			.as_ref()
			.is_some_and(|s| s.open.load(Ordering::Acquire))
	}

	/// Open the stream; completes once the websocket handshake is done.
	///
	/// Any previous session is closed first.
	pub async fn connect(
		&self,
		endpoint: &StreamEndpoint,
		heartbeat_interval: Duration,
		credential: Option<&Credential>,
	) -> Result<(), TransportError> {
		if heartbeat_interval < Duration::from_secs(1) {
			return Err(TransportError::InvalidHeartbeat(heartbeat_interval));
		}

		self.close();

		let request = ConnectRequest {
			url: endpoint.url().clone(),
			bearer: credential.map(|c| c.access_token.clone()),
		};
		let ws = (self.connector)(request).await.map_err(TransportError::Handshake)?;

		let session_id = new_session_id();
		let (sink, stream) = ws.split();
		let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
		let open = Arc::new(AtomicBool::new(true));
		let watchdog = Arc::new(HeartbeatWatchdog::new(heartbeat_interval));

		tokio::spawn(run_writer(sink, outbound_rx));

		let reader = tokio::spawn(run_reader(
			stream,
			Arc::clone(&self.decoder),
			self.events_tx.clone(),
			outbound_tx.clone(),
			Arc::clone(&open),
			Arc::clone(&watchdog),
		));

		let watchdog_task = tokio::spawn(run_watchdog(
			heartbeat_interval,
			watchdog,
			Arc::clone(&open),
			self.events_tx.clone(),
			session_id.clone(),
		));

		info!(%endpoint, %session_id, interval_secs = heartbeat_interval.as_secs(), "stream transport open");

		*self.session.lock() = Some(Session {
			id: session_id,
			outbound: outbound_tx,
			open,
			reader,
			watchdog: watchdog_task,
		});

		Ok(())
	}

	/// Queue a text frame.
	pub async fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
		let outbound = {
			let guard = self.session.lock();
			match guard.as_ref() {
				Some(s) if s.open.load(Ordering::Acquire) => s.outbound.clone(),
				_ => return Err(TransportError::NotOpen),
			}
		};

		outbound
			.send(Message::text(text.into()))
			.await
			.map_err(|_| TransportError::NotOpen)
	}

	/// Close the stream. Idempotent; never emits [`TransportEvent::Closed`].
	pub fn close(&self) {
		let Some(session) = self.session.lock().take() else {
			return;
		};

		session.open.store(false, Ordering::Release);
		let _ = session.outbound.try_send(Message::Close(None));
		debug!(session_id = %session.id, "stream transport closed locally");
	}
}

impl Drop for StreamingTransport {
	fn drop(&mut self) {
		self.close();
	}
}

fn default_connector() -> WsConnector {
	Arc::new(|req: ConnectRequest| Box::pin(connect_ws(req)) as BoxFuture<'static, anyhow::Result<WsStream>>)
}

async fn connect_ws(req: ConnectRequest) -> anyhow::Result<WsStream> {
	let mut request = req
		.url
		.as_str()
		.into_client_request()
		.context("build websocket request")?;

	if let Some(token) = &req.bearer {
		let value = HeaderValue::from_str(&format!("Bearer {}", token.expose())).context("build authorization header")?;
		request.headers_mut().insert(AUTHORIZATION, value);
	}

	let (ws, _resp) = tokio_tungstenite::connect_async(request)
		.await
		.context("connect_async to stream endpoint")?;
	Ok(ws)
}

async fn run_writer(mut sink: futures_util::stream::SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
	while let Some(msg) = rx.recv().await {
		let closing = matches!(msg, Message::Close(_));
		if let Err(e) = sink.send(msg).await {
			debug!(error = %e, "stream transport write failed");
			break;
		}
		if closing {
			break;
		}
	}
	let _ = sink.close().await;
}

async fn run_reader(
	mut stream: futures_util::stream::SplitStream<WsStream>,
	decoder: Arc<dyn MessageDecoder>,
	events_tx: broadcast::Sender<TransportEvent>,
	outbound: mpsc::Sender<Message>,
	open: Arc<AtomicBool>,
	watchdog: Arc<HeartbeatWatchdog>,
) {
	let reason = loop {
		let Some(msg) = stream.next().await else {
			break "stream ended".to_string();
		};

		let msg = match msg {
			Ok(m) => m,
			Err(e) => break format!("read error: {e}"),
		};

		let raw = match &msg {
			Message::Text(t) => t.as_bytes(),
			Message::Binary(b) => &b[..],
			Message::Ping(p) => {
				watchdog.touch();
				let _ = outbound.try_send(Message::Pong(p.clone()));
				continue;
			}
			Message::Pong(_) => {
				watchdog.touch();
				continue;
			}
			Message::Close(frame) => break format!("closed by remote: {frame:?}"),
			Message::Frame(_) => continue,
		};

		match decoder.decode(raw) {
			Ok(decoded) => {
				if decoded.kind.is_heartbeat() {
					watchdog.touch();
				}
				let _ = events_tx.send(TransportEvent::Message(decoded));
			}
			Err(e) => {
				metrics::counter!("streamhub_transport_decode_errors_total").increment(1);
				debug!(error = %e, "dropping undecodable frame");
			}
		}
	};

	if open.swap(false, Ordering::AcqRel) {
		info!(%reason, "stream transport closed");
		let _ = events_tx.send(TransportEvent::Closed { reason });
	}
}

async fn run_watchdog(
	interval: Duration,
	watchdog: Arc<HeartbeatWatchdog>,
	open: Arc<AtomicBool>,
	events_tx: broadcast::Sender<TransportEvent>,
	session_id: String,
) {
	let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		ticker.tick().await;
		if !open.load(Ordering::Acquire) {
			break;
		}

		if let Some(silent_for) = watchdog.check(Instant::now()) {
			metrics::counter!("streamhub_transport_heartbeat_timeouts_total").increment(1);
			warn!(
				%session_id,
				silent_ms = silent_for.as_millis() as u64,
				timeout_ms = watchdog.timeout().as_millis() as u64,
				"heartbeat watchdog triggered"
			);
			let _ = events_tx.send(TransportEvent::HeartbeatTimeout { silent_for });
			break;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::future::Future;

	use tokio::net::TcpListener;
	use tokio::time::timeout;
	use tokio_tungstenite::WebSocketStream;

	use super::*;
	use crate::eventsub::{EventSubDecoder, MessageKind};

	const WELCOME: &str = r#"{"metadata":{"message_id":"w","message_type":"session_welcome"},"payload":{"session":{"id":"s"}}}"#;
	const NOTIFICATION: &str = r#"{"metadata":{"message_id":"n","message_type":"notification","subscription_type":"channel.follow"},"payload":{"event":{"user_id":"42"}}}"#;

	async fn spawn_server<F, Fut>(handler: F) -> StreamEndpoint
	where
		F: FnOnce(WebSocketStream<tokio::net::TcpStream>) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
		let addr = listener.local_addr().expect("local addr");
		tokio::spawn(async move {
			let (stream, _) = listener.accept().await.expect("accept");
			let ws = tokio_tungstenite::accept_async(stream).await.expect("ws accept");
			handler(ws).await;
		});
		StreamEndpoint::parse(&format!("ws://{addr}/ws")).expect("endpoint")
	}

	fn transport() -> StreamingTransport {
		StreamingTransport::new(Arc::new(EventSubDecoder::new()))
	}

	async fn next_event(rx: &mut broadcast::Receiver<TransportEvent>) -> TransportEvent {
		timeout(Duration::from_secs(30), rx.recv())
			.await
			.expect("event within timeout")
			.expect("channel open")
	}

	#[test]
	fn timeout_window_has_a_floor() {
		assert_eq!(heartbeat_timeout(Duration::from_secs(1)), Duration::from_secs(5));
		assert_eq!(heartbeat_timeout(Duration::from_secs(10)), Duration::from_secs(20));
	}

	#[tokio::test(start_paused = true)]
	async fn watchdog_fires_once_per_episode() {
		let wd = HeartbeatWatchdog::new(Duration::from_secs(1));
		let start = Instant::now();

		assert_eq!(wd.check(start + Duration::from_secs(4)), None);
		assert_eq!(wd.check(start + Duration::from_secs(5)), None);
		assert_eq!(wd.check(start + Duration::from_secs(6)), Some(Duration::from_secs(6)));
		assert_eq!(wd.check(start + Duration::from_secs(7)), None);
	}

	#[tokio::test(start_paused = true)]
	async fn touch_pushes_the_deadline_out() {
		let wd = HeartbeatWatchdog::new(Duration::from_secs(1));
		tokio::time::advance(Duration::from_secs(4)).await;
		wd.touch();
		let now = Instant::now();
		assert_eq!(wd.check(now + Duration::from_secs(4)), None);
		assert!(wd.check(now + Duration::from_secs(6)).is_some());
	}

	#[tokio::test]
	async fn rejects_sub_second_heartbeat_interval() {
		let t = transport();
		let endpoint = StreamEndpoint::parse("ws://127.0.0.1:9").unwrap();
		let err = t.connect(&endpoint, Duration::from_millis(500), None).await.unwrap_err();
		assert!(matches!(err, TransportError::InvalidHeartbeat(_)));
	}

	#[tokio::test]
	async fn delivers_decoded_messages() {
		let endpoint = spawn_server(|mut ws| async move {
			ws.send(Message::text(WELCOME)).await.expect("send welcome");
			ws.send(Message::text(NOTIFICATION)).await.expect("send notification");
			while ws.next().await.is_some() {}
		})
		.await;

		let t = transport();
		let mut rx = t.subscribe();
		t.connect(&endpoint, Duration::from_secs(10), None).await.expect("connect");
		assert!(t.is_open());

		match next_event(&mut rx).await {
			TransportEvent::Message(m) => assert_eq!(m.kind, MessageKind::Welcome),
			other => panic!("expected welcome, got {other:?}"),
		}
		match next_event(&mut rx).await {
			TransportEvent::Message(m) => {
				assert_eq!(m.kind, MessageKind::Notification);
				assert_eq!(m.subscription_type.as_deref(), Some("channel.follow"));
			}
			other => panic!("expected notification, got {other:?}"),
		}

		t.close();
	}

	#[tokio::test]
	async fn send_reaches_the_remote() {
		let (seen_tx, mut seen_rx) = mpsc::channel::<String>(1);
		let endpoint = spawn_server(move |mut ws| async move {
			while let Some(Ok(msg)) = ws.next().await {
				if let Message::Text(t) = msg {
					let _ = seen_tx.send(t.as_str().to_string()).await;
				}
			}
		})
		.await;

		let t = transport();
		t.connect(&endpoint, Duration::from_secs(10), None).await.expect("connect");
		t.send("PING").await.expect("send");

		let got = timeout(Duration::from_secs(5), seen_rx.recv()).await.expect("in time");
		assert_eq!(got.as_deref(), Some("PING"));
	}

	#[tokio::test]
	async fn remote_close_is_reported() {
		let endpoint = spawn_server(|mut ws| async move {
			ws.send(Message::text(WELCOME)).await.expect("send welcome");
			let _ = ws.close(None).await;
		})
		.await;

		let t = transport();
		let mut rx = t.subscribe();
		t.connect(&endpoint, Duration::from_secs(10), None).await.expect("connect");

		loop {
			match next_event(&mut rx).await {
				TransportEvent::Closed { .. } => break,
				TransportEvent::Message(_) => continue,
				other => panic!("unexpected event {other:?}"),
			}
		}
		assert!(!t.is_open());
	}

	#[tokio::test]
	async fn local_close_is_idempotent_and_silent() {
		let endpoint = spawn_server(|mut ws| async move { while ws.next().await.is_some() {} }).await;

		let t = transport();
		let mut rx = t.subscribe();
		t.connect(&endpoint, Duration::from_secs(10), None).await.expect("connect");

		t.close();
		t.close();
		assert!(!t.is_open());
		assert!(matches!(t.send("x").await, Err(TransportError::NotOpen)));

		let res = timeout(Duration::from_millis(200), rx.recv()).await;
		assert!(res.is_err(), "local close must not emit events");
	}

	#[tokio::test(start_paused = true)]
	async fn silent_stream_triggers_heartbeat_timeout() {
		let endpoint = spawn_server(|mut ws| async move {
			ws.send(Message::text(WELCOME)).await.expect("send welcome");
			while ws.next().await.is_some() {}
		})
		.await;

		let t = transport();
		let mut rx = t.subscribe();
		t.connect(&endpoint, Duration::from_secs(1), None).await.expect("connect");

		let silent_for = loop {
			match next_event(&mut rx).await {
				TransportEvent::HeartbeatTimeout { silent_for } => break silent_for,
				TransportEvent::Message(_) => continue,
				other => panic!("unexpected event {other:?}"),
			}
		};
		assert!(silent_for > Duration::from_secs(5));
	}
}
