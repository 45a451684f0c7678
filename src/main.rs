use aluna_bridge::{Bridge, BridgeConfig};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, Registry};

type LogLevelHandle = reload::Handle<LevelFilter, Registry>;

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = setup()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load(config_path.as_deref()).await?;
    log_level
        .reload(level_for(config.debug))
        .map_err(|e| eyre!("Failed to apply log level: {}", e))?;

    info!(
        "Starting bridge against {}",
        config.broker.url.as_deref().unwrap_or("<no broker configured>")
    );
    let bridge = Bridge::start(&config).map_err(|e| eyre!("Failed to start bridge: {}", e))?;

    let mut stream = bridge.open_stream();
    let stream_task = tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            debug!("Stream event: {}", event.to_sse().trim_end());
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C");

    match serde_json::to_string(&bridge.snapshot().await) {
        Ok(snapshot) => info!("Final state: {}", snapshot),
        Err(e) => error!("Unable to serialize state: {}", e),
    }

    stream_task.abort();
    bridge.shutdown().await;
    Ok(())
}

fn setup() -> Result<LogLevelHandle> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(setup_logging_env())
}

/// INFO until the config is loaded; the debug toggle raises it afterwards
fn setup_logging_env() -> LogLevelHandle {
    let (level, handle) = reload::Layer::new(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(level)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
    handle
}

fn level_for(debug: bool) -> LevelFilter {
    if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}
