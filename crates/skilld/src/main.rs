//! skilld - runs the built-in switch skill against an MQTT broker.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::WrapErr;
use skill_core::SkillConfig;
use skilld::bus::mqtt::MqttConnector;
use skilld::metrics::HealthChecker;
use skilld::server::{self, AppState};
use skilld::storage::Storage;
use skilld::switch::SwitchSkill;
use skilld::SkillRuntime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "skilld", about = "Voice assistant skill runtime", version)]
struct Cli {
    /// YAML config file, or a directory of YAML files merged alphabetically
    #[arg(short, long, env = "SKILLD_CONFIG")]
    config: PathBuf,

    /// Serve /health and /metrics on this port
    #[arg(long)]
    http_port: Option<u16>,

    /// Device registry database
    #[arg(long)]
    database: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = SkillConfig::load(&cli.config)
        .wrap_err_with(|| format!("failed to load config from {}", cli.config.display()))?;
    if let Some(port) = cli.http_port {
        config.http_port = Some(port);
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: SkillConfig) -> eyre::Result<()> {
    info!("database: {}", config.database_path.display());
    let storage = Storage::new(&config.database_path).await?;
    storage.migrate_embedded().await?;

    let skill = Arc::new(SwitchSkill::new(config.skill_id()));
    let connector = MqttConnector::from_config(&config);
    let http_port = config.http_port;
    let skill_runtime = SkillRuntime::new(skill, config, connector, Arc::new(storage));

    if let Some(port) = http_port {
        let state = Arc::new(AppState {
            metrics: skill_runtime.metrics(),
            checker: HealthChecker::default(),
            supervisor: skill_runtime.supervisor(),
            bus: skill_runtime.bus(),
        });
        skill_runtime
            .supervisor()
            .spawn("http-server", server::start_server(state, port));
    }

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = skill_runtime.run(shutdown).await;
    signals.abort();
    if let Err(e) = &result {
        error!("skill runtime error: {}", e);
    }
    Ok(result?)
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) =
            (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
        else {
            error!("failed to register signal handlers");
            return;
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, initiating graceful shutdown");
        }
    }

    shutdown.cancel();
}
