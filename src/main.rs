use std::path::PathBuf;

use authorize::{
    AppState, build_app,
    authz::CelEvaluator,
    config::{AuthorizeConfig, ConfigError},
    observability,
};
use clap::Parser;

/// Config file used when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "authorize.toml";

/// CLI arguments for the authorization sidecar
#[derive(Parser, Debug)]
#[command(version, about = "External-authorization sidecar", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./authorize.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the authorization server (default)
    Serve,
    /// Validate the configuration file and compile its policies
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::CheckConfig) => run_check_config(args.config.as_deref()),
        Some(Command::Serve) | None => run_server(args.config.as_deref()).await,
    }
}

fn load_config(explicit_config_path: Option<&str>) -> (PathBuf, AuthorizeConfig) {
    let config_path = PathBuf::from(explicit_config_path.unwrap_or(DEFAULT_CONFIG_PATH));

    match AuthorizeConfig::from_file(&config_path) {
        Ok(config) => (config_path, config),
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        }
    }
}

async fn run_server(explicit_config_path: Option<&str>) {
    let (config_path, config) = load_config(explicit_config_path);

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    tracing::info!(
        config_file = %config_path.display(),
        "Starting authorization sidecar"
    );

    if config.authorize.forward_auth_url.is_none() {
        tracing::info!("No forward_auth_url configured; forward-auth requests are not unwrapped");
    }
    if config.policies.is_empty() {
        tracing::warn!(
            default_effect = ?config.authorize.default_effect,
            "No policies configured; every request gets the default effect"
        );
    }

    let state = match AppState::from_config(&config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize authorization pipeline");
            std::process::exit(1);
        }
    };

    let app = build_app(&config, state);

    let bind_addr = config.server.socket_addr();
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, address = %bind_addr, "Failed to bind");
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

    tracing::info!("Server shut down");
}

fn run_check_config(explicit_config_path: Option<&str>) {
    let (config_path, config) = load_config(explicit_config_path);

    if let Err(e) = config.require_identity_store() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    if config.authorize.shared_secret.is_none() {
        let e = ConfigError::Validation("authorize.shared_secret is required".to_string());
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let evaluator = match CelEvaluator::new(&config.policies, &config.authorize) {
        Ok(evaluator) => evaluator,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    println!("Configuration OK: {}", config_path.display());
    println!("  policies:          {}", config.policies.len());
    println!("  compiled programs: {}", evaluator.program_count());
    println!(
        "  forward-auth:      {}",
        config
            .authorize
            .forward_auth_url
            .as_ref()
            .map_or("disabled".to_string(), |url| url.to_string())
    );
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
