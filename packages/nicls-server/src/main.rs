use anyhow::Context;
use clap::Parser;
use nicls_server::{
    bus::EventBus,
    cli::{check_config, Cli, Commands},
    config::ServerConfig,
    data_log::DataLog,
    jobs::PoolRegistry,
    protocol::{ServerContext, TaskServer},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nicls_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::from_env()?;
    cli.apply(&mut config);

    if let Some(Commands::CheckConfig) = cli.command {
        let path = config
            .experiment_config
            .as_deref()
            .context("check-config needs --config or NICLS_CONFIG")?;
        println!("{}", check_config(path)?);
        return Ok(());
    }

    info!("Starting NICLS server v{}", VERSION);
    let base_config = config
        .load_experiment()
        .context("failed to load base experiment configuration")?;
    info!(
        bind = %config.bind_address(),
        experiment = ?config.experiment_config,
        data_log = %config.data_log.display(),
        "Configuration loaded"
    );

    let (data_log, log_writer) = DataLog::open(&config.data_log)
        .await
        .with_context(|| format!("failed to open activity log {:?}", config.data_log))?;

    let context = ServerContext {
        bus: EventBus::new(),
        pools: Arc::new(PoolRegistry::new()),
        data_log,
        base_config: Arc::new(base_config),
    };
    let server = TaskServer::bind(config.bind_address(), context)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
            shutdown.cancel();
        });
    }

    server.run(shutdown).await;

    // Server and every connection hold the last log handles
    if let Err(e) = log_writer.await {
        error!("Activity log writer failed: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}
