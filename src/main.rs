//! Relay server binary
//!
//! Usage: iptv-relay [CONFIG_FILE]
//!
//! The configuration file defaults to `$MYIPTV_CONFIG`, then `myiptv.json`
//! in the working directory, then `myiptv.json` beside the executable.
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use iptv_relay::catalog::ChannelCatalog;
use iptv_relay::config::{ConfigFile, ConfigStore};
use iptv_relay::server::{AppState, RelayServer, ServerConfig, ServerExit};

fn print_usage() {
    eprintln!("Usage: iptv-relay [CONFIG_FILE]");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  MYIPTV_CONFIG   configuration file when none is given");
    eprintln!("  RUST_LOG        log filter (default: info)");
}

/// Resolves on Ctrl-C or, on unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let explicit = args
        .get(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("MYIPTV_CONFIG").map(PathBuf::from));
    let path = ConfigFile::locate(explicit);

    let file = Arc::new(ConfigFile::load(&path).await);
    let document = file.document().await;

    let mut config = document.config;
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration, using defaults");
        config = Default::default();
    }
    config.populate_defaults();

    let catalog = match ChannelCatalog::with_groups(document.channel_groups) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::error!(error = %e, "Invalid channel catalog, starting empty");
            ChannelCatalog::new()
        }
    };

    tracing::info!(
        path = %path.display(),
        server_addr = %config.server_addr,
        mcast_iface = %config.mcast_iface,
        groups = catalog.list().len(),
        "Configuration loaded"
    );

    let config = Arc::new(ConfigStore::new(config));
    let settings = ServerConfig::default();
    let state = AppState::build(&settings, Arc::new(catalog), Arc::clone(&config))?
        .with_file(file);

    // Live components re-read the store at their own start boundaries;
    // this only records that a change happened.
    let mut changes = config.on_change();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let current = changes.borrow_and_update().clone();
            tracing::debug!(
                server_addr = %current.server_addr,
                "Configuration change observed, new listen address applies on restart"
            );
        }
    });

    let server = RelayServer::new(settings, state);
    loop {
        match server.run_until(shutdown_signal()).await? {
            ServerExit::Restart => {
                tracing::info!(addr = %server.bind_addr(), "Rebinding HTTP server");
            }
            ServerExit::Shutdown => break,
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}
