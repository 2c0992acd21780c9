#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use tagline_util::endpoint::{DEFAULT_BIND, IrcEndpoint};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::client::ServerIdentity;
use crate::server::connection::serve;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::history::History;
use crate::server::state::ServerContext;

const USAGE: &str = "\
tagline_server: IRC server with labeled-response batching

Usage: tagline_server [--bind [irc://]host[:port]] [--config path]

Options:
\t--bind    Listen address, IP literal only (default: irc://127.0.0.1, port 6667)
\t--config  TOML config file (default: ~/.tagline/config.toml)
\t--help    Show this help

Environment:
\tTAGLINE_SERVER_NAME, TAGLINE_NETWORK_NAME, TAGLINE_SERVER_TIME,
\tTAGLINE_OUTBOUND_QUEUE_CAPACITY, TAGLINE_HISTORY_CAPACITY,
\tTAGLINE_METRICS_BIND, TAGLINE_HEALTH_BIND   override the config file
\tRUST_LOG                                    log filter (default: info,tagline_server=debug)
\tOTEL_EXPORTER_OTLP_ENDPOINT                 export traces over OTLP/gRPC
";

struct Args {
	bind: SocketAddr,
	config: Option<PathBuf>,
}

/// `Ok(None)` when help was requested.
fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<Args>> {
	let mut bind = DEFAULT_BIND.to_string();
	let mut config = None;

	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--help" | "-h" => return Ok(None),
			"--bind" => bind = args.next().ok_or_else(|| anyhow!("--bind needs a value"))?,
			"--config" => {
				let path = args.next().ok_or_else(|| anyhow!("--config needs a path"))?;
				config = Some(PathBuf::from(path));
			}
			other => return Err(anyhow!("unknown argument: {other}")),
		}
	}

	let bind = IrcEndpoint::parse(&bind)?.to_socket_addr_if_ip_literal()?;
	Ok(Some(Args { bind, config }))
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tagline_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("tagline_server");
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

	match bind.parse::<SocketAddr>() {
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = match parse_args(std::env::args().skip(1)) {
		Ok(Some(args)) => args,
		Ok(None) => {
			print!("{USAGE}");
			return Ok(());
		}
		Err(e) => {
			eprint!("error: {e}\n\n{USAGE}");
			std::process::exit(2);
		}
	};

	init_tracing();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let ctx = Arc::new(ServerContext::new(
		ServerIdentity::new(&server_cfg.server.name, &server_cfg.server.network_name),
		History::new(server_cfg.server.history_config()),
		server_cfg.server.connection_settings(),
		server_cfg.accounts.clone(),
	));

	let listener = TcpListener::bind(args.bind).await?;
	info!(
		bind = %args.bind,
		server = %server_cfg.server.name,
		accounts = server_cfg.accounts.len(),
		"tagline_server: listening"
	);

	health_state.mark_ready();
	serve(listener, ctx, health_state).await
}

#[cfg(test)]
mod tests {
	use super::*;

	fn args(list: &[&str]) -> anyhow::Result<Option<Args>> {
		parse_args(list.iter().map(|s| s.to_string()))
	}

	#[test]
	fn defaults_to_loopback_6667() {
		let parsed = args(&[]).unwrap().unwrap();
		assert_eq!(parsed.bind.to_string(), "127.0.0.1:6667");
		assert!(parsed.config.is_none());
	}

	#[test]
	fn bind_and_config_are_parsed() {
		let parsed = args(&["--bind", "0.0.0.0:7000", "--config", "/etc/tagline.toml"])
			.unwrap()
			.unwrap();
		assert_eq!(parsed.bind.to_string(), "0.0.0.0:7000");
		assert_eq!(parsed.config, Some(PathBuf::from("/etc/tagline.toml")));
	}

	#[test]
	fn help_and_errors() {
		assert!(args(&["--help"]).unwrap().is_none());
		assert!(args(&["--bind"]).is_err());
		assert!(args(&["--bind", "irc.example.com"]).is_err());
		assert!(args(&["--verbose"]).is_err());
	}
}
