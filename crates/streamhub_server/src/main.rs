#![forbid(unsafe_code)]

mod config;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use streamhub_domain::EventType;
use streamhub_domain::lifecycle::parse_status_event;
use streamhub_platform::{
	ConnectionProvider, ConnectionRegistry, EventSubDecoder, StaticCredentialProvider, StreamConnectionConfig,
	StreamConnectionProvider,
};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::server::connection_manager::ConnectionManager;
use crate::server::event_bus::{EventBus, Subscription};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::persistence::{EventPersistence, InMemoryEventStore, SqlEventStore};
use crate::server::reporter::{ErrorReporter, TracingErrorReporter};

/// Ring size of the fallback in-memory event store.
const IN_MEMORY_STORE_CAPACITY: usize = 10_000;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: streamhub_server [--config path]\n\
\n\
Options:\n\
\t--config  TOML config file (default: ~/.streamhub/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,streamhub_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("streamhub_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn build_persistence(cfg: &ServerConfig) -> anyhow::Result<Option<Arc<dyn EventPersistence>>> {
	if !cfg.bus.persistence_enabled {
		return Ok(None);
	}
	match cfg.database_url.as_deref() {
		Some(url) => {
			let store = SqlEventStore::connect(url).await?;
			info!("bus persistence: sql store");
			Ok(Some(Arc::new(store)))
		}
		None => {
			info!(capacity = IN_MEMORY_STORE_CAPACITY, "bus persistence: in-memory store");
			Ok(Some(Arc::new(InMemoryEventStore::new(IN_MEMORY_STORE_CAPACITY))))
		}
	}
}

fn build_registry(cfg: &ServerConfig) -> ConnectionRegistry {
	let decoder = Arc::new(EventSubDecoder::new());
	let providers = cfg
		.platforms
		.iter()
		.map(|p| {
			let mut conn_cfg = StreamConnectionConfig::new(p.id.clone(), p.endpoint.clone());
			conn_cfg.heartbeat_interval = cfg.transport.heartbeat_interval;
			conn_cfg.resume_delay = cfg.transport.resume_delay;
			conn_cfg.enabled = p.enabled;

			let credentials = Arc::new(StaticCredentialProvider::new(p.access_token.clone()));
			let mut provider = StreamConnectionProvider::new(conn_cfg, credentials, decoder.clone());
			if let Some(name) = &p.display_name {
				provider = provider.with_display_name(name.clone());
			}
			Box::new(provider) as Box<dyn ConnectionProvider>
		})
		.collect();
	ConnectionRegistry::new(providers)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), platforms = server_cfg.platforms.len(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let reporter: Arc<dyn ErrorReporter> = Arc::new(TracingErrorReporter);
	let persistence = build_persistence(&server_cfg).await?;
	let bus = EventBus::start_with(server_cfg.bus.clone(), persistence, Arc::clone(&reporter))?;

	bus.subscribe(
		Subscription::from_fn(|ev| {
			if let Some(view) = parse_status_event(ev) {
				debug!(platform = %view.platform, state = %view.state, detail = %view.detail, "lifecycle");
			}
			Ok(())
		})
		.with_filter(|ev| ev.kind == EventType::System)
		.with_priority(i32::MIN),
	);

	let registry = Arc::new(build_registry(&server_cfg));
	for info in registry.snapshot() {
		info!(platform = %info.id, name = %info.metadata.display_name, "platform registered");
	}

	let manager = ConnectionManager::with_reporter(registry, bus.clone(), server_cfg.manager.clone(), reporter)?;
	manager.start();
	health_state.mark_ready();
	info!("streamhub_server: running (ctrl-c to stop)");

	if let Err(e) = tokio::signal::ctrl_c().await {
		warn!(error = %e, "failed to listen for ctrl-c; shutting down");
	}

	health_state.mark_not_ready();
	manager.shutdown().await;
	bus.stop();

	for snap in manager.summary() {
		info!(
			platform = %snap.platform,
			connects = snap.connects,
			disconnects = snap.disconnects,
			failed_attempts = snap.failed_attempts,
			"platform totals"
		);
	}

	let m = bus.metrics();
	info!(
		published = m.published,
		delivered = m.delivered,
		dropped = m.dropped,
		persist_failures = m.persist_failures,
		"streamhub_server: stopped"
	);
	Ok(())
}
