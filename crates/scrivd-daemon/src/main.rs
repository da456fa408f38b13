//! scrivd-daemon binary: wiring for the admin control plane.
//!
//! Startup order matters: tracing first (with a reload handle so the
//! console can retune verbosity at runtime), then configuration, then the
//! reactor on its dedicated thread, then the metrics endpoint and signal
//! handling on the main runtime. The reactor owns all admin state; this
//! file only posts callbacks into it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scrivd_core::broker::DocumentBroker;
use scrivd_core::config::{AdminConfig, KitLimits};
use scrivd_core::process::{ProcessControl, SystemProcessControl};
use scrivd_daemon::{metrics, reactor};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// scrivd admin control plane daemon.
#[derive(Parser, Debug)]
#[command(name = "scrivd-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "scrivd.toml")]
    config: PathBuf,

    /// Unix socket path for the admin console (overrides config).
    #[arg(long)]
    console_socket: Option<PathBuf>,

    /// Port for the plain-text metrics endpoint (overrides config).
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Disable the metrics endpoint.
    #[arg(long)]
    no_metrics: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout; also backs the `log_lines` command.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Admin secret for console token verification (overrides config).
    #[arg(long, env = "SCRIVD_ADMIN_SECRET", hide_env_values = true)]
    admin_secret: Option<String>,
}

type ReloadHandle = reload::Handle<EnvFilter, Registry>;

fn init_tracing(args: &Args) -> Result<ReloadHandle> {
    let filter =
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    if let Some(path) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(reload_handle)
}

/// Broker seam for standalone operation.
///
/// The daemon is designed to be embedded next to a document broker that
/// implements [`DocumentBroker`] over real kits; running standalone (no
/// broker, no kits) this implementation logs the requested actions and
/// tracks only the shutdown flag, which keeps every console command and
/// periodic task exercisable.
struct StandaloneBroker {
    server_id: String,
    shutdown: AtomicBool,
}

impl StandaloneBroker {
    fn new(server_id: String) -> Self {
        Self {
            server_id,
            shutdown: AtomicBool::new(false),
        }
    }
}

impl DocumentBroker for StandaloneBroker {
    fn close_document(&self, doc_key: &str, reason: &str) {
        info!(doc_key, reason, "close_document requested (standalone, no-op)");
    }
    fn auto_save(&self, doc_key: &str) {
        info!(doc_key, "auto_save requested (standalone, no-op)");
    }
    fn alert_user(&self, doc_key: &str, message: &str) {
        debug!(doc_key, message, "alert_user (standalone, no-op)");
    }
    fn alert_all_users(&self, message: &str) {
        debug!(message, "alert_all_users (standalone, no-op)");
    }
    fn kit_pids(&self) -> HashSet<i32> {
        HashSet::new()
    }
    fn spawner_pid(&self) -> Option<i32> {
        None
    }
    fn is_kit_process(&self) -> bool {
        false
    }
    fn engine_version(&self) -> String {
        "standalone".to_string()
    }
    fn server_id(&self) -> String {
        self.server_id.clone()
    }
    fn set_route_token(&self, _token: &str) {
        debug!("route token updated");
    }
    fn forward_kit_log_level(&self, level: &str) {
        debug!(level, "kit log level forwarded (standalone, no-op)");
    }
    fn forward_kit_limits(&self, limits: &KitLimits) {
        debug!(?limits, "kit limits forwarded (standalone, no-op)");
    }
    fn set_migration_acknowledged(&self, doc_key: &str) {
        debug!(doc_key, "migration acknowledged");
    }
    fn set_all_migration_acknowledged(&self) {
        debug!("all migrations acknowledged");
    }
    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

fn load_config(args: &Args) -> Result<AdminConfig> {
    let mut config = if args.config.exists() {
        AdminConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!(path = %args.config.display(), "no config file found, using defaults");
        AdminConfig::default()
    };

    if let Some(socket) = &args.console_socket {
        config.server.console_socket.clone_from(socket);
    }
    if let Some(port) = args.metrics_port {
        config.server.metrics_port = port;
    }
    if let Some(secret) = &args.admin_secret {
        config.admin.secret.clone_from(secret);
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let reload_handle = init_tracing(&args)?;
    let config = load_config(&args)?;
    let metrics_port = config.server.metrics_port;

    let server_id = format!("scrivd-{}", std::process::id());
    let (handle, reactor_thread) = reactor::spawn(
        config,
        Box::new(move || Rc::new(StandaloneBroker::new(server_id)) as Rc<dyn DocumentBroker>),
        Box::new(|| Rc::new(SystemProcessControl) as Rc<dyn ProcessControl>),
    )
    .context("failed to spawn admin reactor")?;

    // Wire the runtime log retuning and the log_lines source into the
    // reactor; both live behind the callback queue like every other
    // cross-thread mutation.
    {
        let log_file = args.log_file.clone();
        let reload_handle = reload_handle.clone();
        handle.post(move |admin| {
            admin.log_file = log_file;
            admin.log_levels.set_applier(Box::new(move |level| {
                match EnvFilter::try_new(level) {
                    Ok(filter) => {
                        if reload_handle.modify(|f| *f = filter).is_err() {
                            warn!("log filter reload failed");
                        }
                    },
                    Err(e) => warn!(level, error = %e, "invalid log level"),
                }
            }));
        });
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    runtime.block_on(async move {
        if args.no_metrics {
            info!("metrics endpoint disabled");
        } else {
            let metrics_handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = metrics::serve(metrics_handle, metrics_port).await {
                    error!(error = %e, "metrics endpoint failed");
                }
            });
        }

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut reactor_done = tokio::task::spawn_blocking(move || {
            let _ = reactor_thread.join();
        });

        tokio::select! {
            _ = &mut reactor_done => {
                info!("admin reactor exited");
                return Ok(());
            },
            _ = sigterm.recv() => info!("SIGTERM received, requesting shutdown"),
            _ = sigint.recv() => info!("SIGINT received, requesting shutdown"),
        }

        handle.request_shutdown();
        let _ = reactor_done.await;
        info!("scrivd admin daemon stopped");
        Ok(())
    })
}
