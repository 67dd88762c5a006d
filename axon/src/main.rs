//! Process bootstrap for the axon data plane.
//!
//! Mode selection: with `CONTROL_PLANE_URL` set, the config file is only the
//! bootstrap snapshot and updates arrive over the push channel; without it,
//! the file is watched and hot-reloaded.

use clap::Parser;
use confsync::push::PushClient;
use confsync::store::ConfigStore;
use confsync::watcher::{DEFAULT_POLL_INTERVAL, FileWatcher, load_initial};
use metrics_exporter_statsd::StatsdBuilder;
use router::RouterConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DRAIN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "axon", about = "Cell-routing ingress data plane")]
struct Args {
    /// Routing config file. In push mode this is only the bootstrap snapshot.
    #[arg(long, env = "CONFIG_PATH", default_value = "config/routing.json")]
    config_path: PathBuf,

    /// Control plane push endpoint (ws:// or wss://). When set, config
    /// updates come over the push channel and the file is not watched.
    #[arg(long, env = "CONTROL_PLANE_URL")]
    control_plane_url: Option<String>,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// statsd host; metrics are disabled when unset.
    #[arg(long, env = "STATSD_HOST")]
    statsd_host: Option<String>,

    #[arg(long, env = "STATSD_PORT", default_value_t = 8125)]
    statsd_port: u16,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("failed to load initial config: {0}")]
    Bootstrap(#[from] confsync::watcher::BootstrapError),
    #[error("failed to create runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Router(#[from] router::errors::RouterError),
}

fn main() {
    init_tracing();

    if let Err(err) = cli() {
        tracing::error!(error = %err, "startup error");
        std::process::exit(1);
    }
}

fn cli() -> Result<(), CliError> {
    let args = Args::parse();
    init_statsd_recorder("axon", args.statsd_host.clone(), args.statsd_port);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> Result<(), CliError> {
    let (snapshot, digest) = load_initial(&args.config_path).await?;
    tracing::info!(
        version = %snapshot.version,
        path = %args.config_path.display(),
        "loaded initial config"
    );
    let store = Arc::new(ConfigStore::new(snapshot));

    let shutdown = CancellationToken::new();

    match &args.control_plane_url {
        Some(url) => {
            tracing::info!(url = %url, "push mode: config updates come from the control plane");
            let client = PushClient::new(url.clone(), store.clone());
            tokio::spawn(client.run(shutdown.clone()));
        }
        None => {
            tracing::info!(
                path = %args.config_path.display(),
                "file mode: hot-reloading the config file"
            );
            let watcher = FileWatcher::new(
                &args.config_path,
                DEFAULT_POLL_INTERVAL,
                store.clone(),
                digest,
            );
            tokio::spawn(watcher.run(shutdown.clone()));
        }
    }

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let config = RouterConfig {
        host: args.host,
        port: args.port,
        drain_grace: DRAIN_GRACE,
    };
    router::run(config, store, shutdown).await?;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(error = %err, "could not install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received, draining");
    shutdown.cancel();
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

fn init_statsd_recorder(prefix: &str, statsd_host: Option<String>, statsd_port: u16) {
    if let Some(host) = statsd_host {
        let recorder = StatsdBuilder::from(host, statsd_port)
            .build(Some(prefix))
            .expect("could not create statsd recorder");
        metrics::set_global_recorder(recorder).expect("could not set global metrics recorder");
    }
}

#[cfg(test)]
mod tests {
    use shared::metrics_defs::render_markdown_table;

    #[test]
    fn all_metric_names_are_unique() {
        let mut names: Vec<&str> = router::metrics_defs::ALL_METRICS
            .iter()
            .chain(confsync::metrics_defs::ALL_METRICS)
            .map(|m| m.name)
            .collect();
        names.sort();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn metrics_render_as_a_table() {
        let table = render_markdown_table(router::metrics_defs::ALL_METRICS);
        assert!(table.contains("`request.duration`"));
    }
}
