// Relay entry point.
//
// Startup sequence:
// 1. Initialize tracing (stderr)
// 2. Load config
// 3. Bind the relay endpoint (fatal on failure)
// 4. Run until Ctrl+C
// 5. Close all connections on exit

use tourney_dash_core::build::BUILD_ID;
use tourney_dash_core::config;
use tourney_dash_core::relay::Relay;

use anyhow::Context;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("tourney-dash relay starting (build {BUILD_ID})");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: endpoint {}{}, idle timeout {}s",
        config.relay.bind_addr(),
        config.relay.path,
        config.relay.idle_timeout_secs
    );

    // 3. Bind the relay; a taken port ends the process with a non-zero status.
    let relay = match Relay::bind(&config.relay).await {
        Ok(relay) => relay,
        Err(e) => {
            error!("{e}");
            return Err(e).context("relay could not start");
        }
    };
    let local_addr = relay.local_addr().context("failed to read relay address")?;
    info!(
        "Clients connect to ws://{}:{}{}",
        config.relay.host,
        local_addr.port(),
        config.relay.path
    );

    // 4. Run until Ctrl+C
    relay.run(shutdown_signal()).await;

    info!("tourney-dash relay shut down cleanly");
    Ok(())
}

/// Resolves on Ctrl+C. If the signal handler cannot be installed the relay
/// keeps running until killed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}

/// Initialize tracing to stderr.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("tourney_dash=info,tourney_dash_core=info,warn")
            }),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
