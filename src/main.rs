//! gantry - a pipeline execution service.
//!
//! Usage:
//!   gantry run        Load pipeline definitions and serve the HTTP API
//!   gantry debug      Print a freshly minted bearer token

use clap::{Parser, Subcommand};
use gantry::api::{self, ApiState};
use gantry::{
    load_pipelines, AppConfig, JsonDataStore, OutputStore, PipelineRunner, StageScheduler,
    TaskRunner,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// gantry - a pipeline execution service
#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service
    Run {
        /// Path to the service configuration file
        #[arg(long, default_value = ".gantry.yml")]
        config: PathBuf,

        /// Base directory to search for pipeline definitions
        #[arg(long, default_value = ".")]
        path: PathBuf,

        /// Glob pattern for definition files, relative to --path
        #[arg(long, default_value = "**/pipelines.yml")]
        pattern: String,

        /// Directory for persistent data (snapshot and task logs)
        #[arg(long, default_value = ".gantry-data")]
        data: PathBuf,

        /// Address for the HTTP API
        #[arg(long, default_value = "127.0.0.1:9009")]
        address: SocketAddr,
    },

    /// Print authorization information for debugging
    Debug {
        /// Path to the service configuration file
        #[arg(long, default_value = ".gantry.yml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            path,
            pattern,
            data,
            address,
        } => {
            run_service(config, path, pattern, data, address).await?;
        }
        Commands::Debug { config } => {
            print_debug_token(config)?;
        }
    }

    Ok(())
}

async fn run_service(
    config: PathBuf,
    path: PathBuf,
    pattern: String,
    data: PathBuf,
    address: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let app_config = AppConfig::load_or_create(&config)?;

    let defs = Arc::new(load_pipelines(&path, &pattern)?);
    info!(
        count = defs.len(),
        path = %path.display(),
        "Loaded pipeline definitions"
    );

    std::fs::create_dir_all(&data)?;
    let output_store = Arc::new(OutputStore::new(&data)?);
    let store = Arc::new(JsonDataStore::new(data.join("store.json")));

    let task_runner = Arc::new(TaskRunner::new(output_store.as_ref().clone()));
    let scheduler = Arc::new(StageScheduler::new(Arc::clone(&task_runner)));

    let shutdown = CancellationToken::new();

    let runner = PipelineRunner::new(
        Arc::clone(&defs),
        Arc::clone(&task_runner),
        scheduler,
        Some(store),
        shutdown.clone(),
    )
    .await?;

    let state = ApiState {
        runner,
        task_runner: Arc::clone(&task_runner),
        output_store,
        jwt_secret: app_config.jwt_secret,
    };

    let serve = tokio::spawn(api::serve(address, state, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    task_runner.cancel();
    serve.await??;

    Ok(())
}

fn print_debug_token(config: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let app_config = AppConfig::load_or_create(&config)?;
    let token = api::mint_token(&app_config.jwt_secret, None)?;

    println!("Send the following HTTP header for authorization:");
    println!("    Authorization: Bearer {}", token);

    Ok(())
}
