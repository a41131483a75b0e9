//! Flux Tunnel - CLI Entry Point
//!
//! - `compile`: print the engine configuration for a connect request
//! - `connect`: run a session until Ctrl-C (Linux)
//! - `check`: validate settings and report what the host provides

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flux_tunnel::{compile, CompileEnv, ConnectRequest, GeoAssets, Settings, VERSION};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "flux-tunnel")]
#[command(version = VERSION)]
#[command(about = "Proxy core session orchestrator")]
struct Args {
    /// Path to settings file; defaults apply when absent
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(short = 'l', long = "log-level", global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "json", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the compiled engine configuration
    Compile {
        /// Connect request JSON (`{outbound, routingMode, routingRules}` or a bare outbound)
        request: PathBuf,
        /// Write to a file instead of stdout
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Connect and hold the session until interrupted
    Connect {
        request: PathBuf,
    },
    /// Validate settings and probe executables and geo assets
    Check,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .enable_all()
        .thread_name("flux-worker")
        .build()?;

    runtime.block_on(async_main(args))
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(format!("flux_tunnel={level},core={level},bridge={level}")),
    };
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

async fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    match path {
        Some(path) => Settings::load_async(path)
            .await
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(Settings::default()),
    }
}

async fn load_request(path: &Path) -> anyhow::Result<ConnectRequest> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(ConnectRequest::from_json(&json)?)
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let settings = load_settings(args.config.as_deref()).await?;
    let level = args.log_level.clone().unwrap_or_else(|| settings.log_level.clone());
    init_logging(&level, args.json)?;

    info!("Flux Tunnel v{}", VERSION);

    match args.command {
        Command::Compile { request, output } => {
            let request = load_request(&request).await?;
            let env = CompileEnv::from_settings(&settings);
            let config = compile(&request.descriptor, &request.policy, &env)?;
            match output {
                Some(path) => {
                    config.write_to(&path).await?;
                    info!("Wrote {}", path.display());
                }
                None => println!("{}", config.to_json_pretty()?),
            }
            Ok(())
        }
        Command::Connect { request } => {
            let request = load_request(&request).await?;
            run_session(settings, request).await
        }
        Command::Check => check(&settings),
    }
}

fn check(settings: &Settings) -> anyhow::Result<()> {
    settings.validate()?;
    info!("Settings valid");

    let core = &settings.core.executable;
    if core.components().count() > 1 && !core.exists() {
        anyhow::bail!("proxy core not found at {}", core.display());
    }
    let geo = GeoAssets::probe(settings.core.asset_dir.as_deref());
    info!(
        "Core: {} | geoip: {} | geosite: {} | SOCKS {}",
        core.display(),
        geo.geoip,
        geo.geosite,
        settings.inbound.socks_addr()
    );
    Ok(())
}

#[cfg(target_os = "linux")]
async fn run_session(settings: Settings, request: ConnectRequest) -> anyhow::Result<()> {
    use flux_tunnel::core::TokioProcessRunner;
    use flux_tunnel::network::{linux::spawn_route_watcher, NetworkBindingMonitor};
    use flux_tunnel::tunnel::linux::LinuxTunDriver;
    use flux_tunnel::SessionController;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::{error, warn};

    let runner = Arc::new(TokioProcessRunner::new());
    let driver = Arc::new(LinuxTunDriver::new(
        runner.clone(),
        settings.tunnel.bridge.clone(),
        settings.core.work_dir.clone(),
    ));
    let tunnel_name = settings.tunnel.name.clone();
    let period = settings.supervision_interval();
    let controller = SessionController::new(settings, runner, driver);

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(16);
    let watcher = spawn_route_watcher(tunnel_name, period, tx, cancel.clone());
    let monitor = NetworkBindingMonitor::new().spawn(controller.clone(), rx, cancel.clone());

    let mut status = controller.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            info!("Connected: {}", *status.borrow_and_update());
        }
    });

    if let Err(e) = controller.connect(request.descriptor, request.policy).await {
        error!("Connect failed: {}", e);
        cancel.cancel();
        return Err(e.into());
    }

    let mut state = controller.subscribe_state();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
        }
        _ = async {
            while state.changed().await.is_ok() {
                if !controller.is_connected() && controller.state() == flux_tunnel::SessionState::Idle {
                    break;
                }
            }
        } => {
            warn!("Session ended");
        }
    }

    controller.disconnect().await;
    cancel.cancel();
    let _ = futures::future::join(watcher, monitor).await;
    info!("Stopped");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_session(_settings: Settings, _request: ConnectRequest) -> anyhow::Result<()> {
    anyhow::bail!("no tunnel driver available on this platform")
}
