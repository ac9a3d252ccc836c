use clap::Parser;
use taskbroker_core::transport::InprocHub;
use taskbroker_server::server::{
    config::{CliArgs, ServerConfig},
    service::BrokerService,
    telemetry::init_telemetry,
};
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry(config.log_format)?;
    log_startup_info(&config);

    // inproc:// endpoints resolve against this hub only.
    let hub = InprocHub::default();
    let service = BrokerService::start(&config, &hub).await?;

    shutdown_signal().await?;

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");

    match service.shutdown().await {
        Ok(_ended) => {
            #[cfg(feature = "tracing")]
            tracing::info!("Service shut down successfully, {_ended} worker(s) ended");
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Error during service shutdown: {:?}", _e);
        }
    }

    providers.shutdown();
    Ok(())
}

fn log_startup_info(_config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting broker with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting broker for task types [{}] with reply order {:?}",
            _config
                .task_types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            _config.reply_order
        );
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }
    Ok(())
}
