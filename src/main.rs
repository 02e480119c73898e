// log-enricher - main.rs
//
// 4.O Application wiring: parse CLI flags, load configuration, construct
// every component, wire signal handling, and drive orderly shutdown.
//
// Shutdown order: the root cancellation token fires
// first; tailers stop and close their channels; the HTTP receiver stops
// accepting new connections but finishes in-flight requests; background
// cache-housekeeping and reload-watcher tasks run one final pass and exit;
// sinks are flushed and closed; state is written last, since every other
// shutdown step may still touch the state store.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use log_enricher::config::{Backend, Config};
use log_enricher::manager::TailerManager;
use log_enricher::pipeline::PipelineManager;
use log_enricher::pool::EntryPool;
use log_enricher::processor::LineProcessor;
use log_enricher::receiver;
use log_enricher::sink::{FileSink, LokiSink, Sink};
use log_enricher::state::StateStore;
use log_enricher::util::constants::{APP_NAME, APP_VERSION};
use log_enricher::util::{error::EnricherError, logging};

/// Sidecar log-enrichment daemon: tails rotating log files, runs each line
/// through a configurable parse/filter/enrich pipeline, and writes or
/// forwards the result to a file or Loki-compatible sink.
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = APP_VERSION)]
struct Cli {
    /// Load configuration and build the pipeline, then exit without
    /// tailing or serving anything. Exit code reflects whether the
    /// configuration was valid.
    #[arg(long)]
    config_check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            // Logging isn't initialised yet (it depends on config); a
            // configuration failure is reported directly to stderr.
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(config.log_level.as_deref());
    tracing::info!(backend = ?config.backend, base_path = %config.log_base_path.display(), "log-enricher starting");

    match build_application(config, cli.config_check).await {
        Ok(Some(app)) => app.run().await,
        Ok(None) => ExitCode::SUCCESS, // --config-check succeeded
        Err(e) => {
            tracing::error!(error = %e, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

/// Everything constructed at startup that `run()` needs to drive and, on
/// shutdown, tear down in order.
struct Application {
    root_token: CancellationToken,
    store: Arc<StateStore>,
    pipeline: Arc<PipelineManager>,
    sink: Arc<dyn Sink>,
    tailer_manager: Arc<TailerManager>,
    http_enabled: bool,
    http_addr: String,
    http_router_deps: Option<(Arc<Config>, Arc<LineProcessor>)>,
}

async fn build_application(config: Config, config_check: bool) -> Result<Option<Application>, EnricherError> {
    let store = Arc::new(StateStore::load(&config.state_file_path).map_err(EnricherError::State)?);

    let pipeline = Arc::new(PipelineManager::from_config(&config.stages, &store).map_err(EnricherError::Config)?);

    let sink: Arc<dyn Sink> = match config.backend {
        Backend::File => Arc::new(FileSink::new(config.enriched_file_suffix.clone())),
        Backend::Loki => {
            let url = config.loki_url.clone().ok_or(EnricherError::Config(
                log_enricher::util::error::ConfigError::MissingLokiUrl,
            ))?;
            Arc::new(LokiSink::new(url))
        }
    };

    if config.http_enabled {
        if let Err(e) = config.http_addr.parse::<std::net::SocketAddr>() {
            return Err(EnricherError::Config(log_enricher::util::error::ConfigError::InvalidValue {
                key: "PROMTAIL_HTTP_ADDR",
                value: config.http_addr.clone(),
                expected: "a host:port socket address",
            }));
        }
    }

    if config_check {
        tracing::info!("configuration and pipeline valid");
        return Ok(None);
    }

    let root_token = CancellationToken::new();
    let pool = EntryPool::new();
    let processor = Arc::new(LineProcessor::new(pool, Arc::clone(&pipeline), Arc::clone(&sink)));
    let tailer_manager = TailerManager::new(&config, Arc::clone(&store), Arc::clone(&processor), Arc::clone(&sink), root_token.clone());

    let http_enabled = config.http_enabled;
    let http_addr = config.http_addr.clone();
    let http_router_deps = http_enabled.then(|| (Arc::new(config), Arc::clone(&processor)));

    Ok(Some(Application {
        root_token,
        store,
        pipeline,
        sink,
        tailer_manager,
        http_enabled,
        http_addr,
        http_router_deps,
    }))
}

impl Application {
    async fn run(self) -> ExitCode {
        self.tailer_manager.initial_scan();
        let watcher_handle = match self.tailer_manager.spawn_watcher() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to start directory watcher");
                None
            }
        };

        let background_handles = self
            .pipeline
            .spawn_background_tasks(Arc::clone(&self.store), self.root_token.clone());

        let http_handle = if self.http_enabled {
            match self.http_router_deps {
                Some((config, processor)) => {
                    let addr: std::net::SocketAddr = config
                        .http_addr
                        .parse()
                        .expect("validated during build_application");
                    let router = receiver::router(Arc::clone(&config), processor);
                    let token = self.root_token.clone();
                    Some(tokio::spawn(async move {
                        if let Err(e) = receiver::serve(router, addr, token).await {
                            tracing::error!(error = %e, "push receiver terminated with an error");
                        }
                    }))
                }
                None => None,
            }
        } else {
            None
        };

        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, stopping");
        self.root_token.cancel();

        self.tailer_manager.shutdown().await;
        if let Some(handle) = watcher_handle {
            let _ = handle.await;
        }
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        for handle in background_handles {
            let _ = handle.await;
        }

        self.sink.shutdown().await;

        if let Err(e) = self.store.save() {
            tracing::error!(error = %e, "failed to persist state on shutdown");
            return ExitCode::FAILURE;
        }

        tracing::info!("log-enricher stopped cleanly");
        ExitCode::SUCCESS
    }
}

/// Wait for SIGINT or (on unix) SIGTERM. Every scope in the application is
/// a child of the root cancellation token fired here.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
