use std::sync::Arc;

use clap::Parser;
use saml_broker::{
    broker::Broker,
    config::BrokerConfig,
    observability::init_tracing,
    routes::{AppState, build_app},
};

/// CLI arguments for the SAML broker
#[derive(Parser, Debug)]
#[command(version, about = "SAML broker", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file
    #[arg(short, long, global = true, default_value = "saml-broker.toml")]
    config: String,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the broker server (default)
    Serve,
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::CheckConfig) => run_check_config(&args.config),
        Some(Command::Serve) | None => run_server(&args.config).await,
    }
}

fn load_config(path: &str) -> BrokerConfig {
    match BrokerConfig::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: failed to load config from {path}: {e}");
            std::process::exit(1);
        }
    }
}

fn run_check_config(path: &str) {
    let config = load_config(path);
    // Keys and the entity id scope are only fully checked once the broker is built
    if let Err(e) = Broker::from_config(&config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    println!("Configuration OK: {path}");
}

async fn run_server(path: &str) {
    let config = load_config(path);

    if let Err(e) = init_tracing(&config.observability) {
        eprintln!("Error: failed to initialize tracing: {e}");
        std::process::exit(1);
    }

    let broker = match Broker::from_config(&config) {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            tracing::error!(error = %e, "Failed to build broker");
            std::process::exit(1);
        }
    };

    // Metadata is fetched in the background; requests that arrive first
    // join the same in-flight fetch.
    tokio::spawn({
        let broker = broker.clone();
        async move { broker.warm_up().await }
    });

    let app = build_app(&config.server, AppState { broker });

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(address = %bind_addr, error = %e, "Failed to bind to address");
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on http://{}", bind_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
