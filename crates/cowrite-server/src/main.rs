//! Cowrite master binary.
//!
//! # Usage
//!
//! ```bash
//! # Spawner binary with a sandbox under /srv/cowrite
//! cowrite-server --spawner /usr/lib/cowrite/forkit --sandbox /srv/cowrite
//!
//! # Bigger warm pool, verbose logs
//! cowrite-server --spawner ./forkit --sandbox /srv/cowrite --warm-pool 4 --log-level debug
//! ```

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use clap::Parser;
use cowrite_core::{EchoPolicy, SandboxRoots, ServiceConfig, ServiceContext, resolve_value};
use cowrite_server::{
    Master, ServerError,
    worker::{ProcessConfig, ProcessSpawner},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Cowrite collaborative document master
#[derive(Parser, Debug)]
#[command(name = "cowrite-server")]
#[command(about = "Cowrite collaborative document master")]
#[command(version)]
struct Args {
    /// Spawner executable that forks document workers
    #[arg(long)]
    spawner: PathBuf,

    /// Extra arguments passed to the spawner
    #[arg(long = "spawner-arg")]
    spawner_args: Vec<String>,

    /// Base directory of the sandbox layout
    #[arg(long)]
    sandbox: PathBuf,

    /// Jail root, overriding `<sandbox>/jails`
    #[arg(long)]
    child_root: Option<PathBuf>,

    /// System template, overriding `<sandbox>/systemplate`
    #[arg(long)]
    sys_template: Option<PathBuf>,

    /// Engine template, overriding `<sandbox>/enginetemplate`
    #[arg(long)]
    engine_template: Option<PathBuf>,

    /// Render cache, overriding `<sandbox>/cache`
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Directory for the worker socket (defaults to the jail root)
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Idle workers kept ready
    #[arg(long)]
    warm_pool: Option<usize>,

    /// Milliseconds an open waits for a worker
    #[arg(long)]
    spawn_timeout_ms: Option<u64>,

    /// Milliseconds allowed for one worker round trip
    #[arg(long)]
    round_trip_timeout_ms: Option<u64>,

    /// Milliseconds allowed for loading a document
    #[arg(long)]
    load_timeout_ms: Option<u64>,

    /// Echo edit deltas back to the sending session too
    #[arg(long)]
    echo_to_sender: bool,

    /// Public server name
    #[arg(long)]
    server_name: Option<String>,

    /// Root of the static file server
    #[arg(long)]
    file_server_root: Option<PathBuf>,

    /// Client transport is encrypted
    #[arg(long)]
    ssl: bool,

    /// Seconds between diagnostics log lines
    #[arg(long, default_value = "60")]
    diagnostics_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "master exiting");
            ExitCode::FAILURE
        },
    }
}

async fn run(args: Args) -> Result<(), ServerError> {
    let cwd = std::env::current_dir()?;
    let config = build_config(&args, &cwd);
    let socket_dir =
        absolute(&cwd, resolve_value(args.socket_dir, config.sandbox.child_root.clone()));

    let ctx = ServiceContext::new(config)?;
    let spawner = ProcessSpawner::new(ProcessConfig {
        program: absolute(&cwd, args.spawner),
        args: args.spawner_args,
        socket_dir,
        sandbox: ctx.config().sandbox.clone(),
        hello_timeout: ctx.config().spawn_timeout,
    });
    tracing::info!(socket = %spawner.socket_path().display(), "cowrite master starting");

    let master = Master::new(ctx, spawner);
    master.start().await?;

    let mut down = master.shutdown_signal();
    let mut report = tokio::time::interval(Duration::from_secs(args.diagnostics_interval.max(1)));

    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("interrupted; shutting down");
                break Ok(());
            },
            _ = down.wait_for(|down| *down) => {
                break Err(ServerError::SpawnerDown);
            },
            _ = report.tick() => {
                tracing::info!(diagnostics = %master.diagnostics(), "status");
            },
        }
    };

    master.shutdown().await;
    outcome
}

fn build_config(args: &Args, cwd: &Path) -> ServiceConfig {
    let base = SandboxRoots::under(absolute(cwd, args.sandbox.clone()));
    let sandbox = SandboxRoots {
        child_root: absolute(cwd, resolve_value(args.child_root.clone(), base.child_root)),
        sys_template: absolute(cwd, resolve_value(args.sys_template.clone(), base.sys_template)),
        engine_template: absolute(
            cwd,
            resolve_value(args.engine_template.clone(), base.engine_template),
        ),
        cache: absolute(cwd, resolve_value(args.cache.clone(), base.cache)),
    };

    let mut config = ServiceConfig::new(sandbox);
    config.warm_pool_size = resolve_value(args.warm_pool, config.warm_pool_size);
    config.spawn_timeout = millis_or(args.spawn_timeout_ms, config.spawn_timeout);
    config.round_trip_timeout = millis_or(args.round_trip_timeout_ms, config.round_trip_timeout);
    config.load_timeout = millis_or(args.load_timeout_ms, config.load_timeout);
    if args.echo_to_sender {
        config.echo_policy = EchoPolicy::IncludeSender;
    }
    config.server_name.clone_from(&args.server_name);
    config.file_server_root = args.file_server_root.clone().map(|root| absolute(cwd, root));
    config.ssl_enabled = args.ssl;
    config
}

fn millis_or(ms: Option<u64>, default: Duration) -> Duration {
    resolve_value(ms.map(Duration::from_millis), default)
}

fn absolute(cwd: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() { path } else { cwd.join(path) }
}
