//! Beamgate - proxy that hands out short-lived Hyperbeam browser sessions.
//!
//! Usage:
//!   beamgate serve [--port 8080]     # Start HTTP server

use beamgate::config::Config;
use beamgate::http_server;
use beamgate::state::AppState;
use clap::{Parser, Subcommand};
use std::process::exit;
use tracing::{error, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "beamgate")]
#[command(about = "Proxy for short-lived Hyperbeam browser sessions")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[command(flatten)]
        config: Config,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beamgate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve { config } => {
            if let Err(e) = config.validate() {
                eprintln!("Error: {}", e);
                exit(1);
            }
            if config.api_key.is_none() {
                warn!("HYPERBEAM_API_KEY is not set; session requests will fail");
            }

            let port = config.port;
            let state = match AppState::with_hyperbeam(config) {
                Ok(state) => state,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            };

            if let Err(e) = http_server::run_server(port, state).await {
                error!("Server error: {}", e);
                exit(1);
            }
        }
    }
}
