//! Sandbox-side executor service.
//!
//! Speaks the Lambda-Function-URL envelope over HTTP, so the same binary
//! serves behind a function URL, the function runtime-interface emulator's
//! invocation route, or directly in a container for local runs.
//!
//! Artifact fetches go to the configured object store; with
//! `USE_LOCAL_DOWNLOADER` set they read from a shared uploads directory
//! instead, mirroring the driver's copying uploader.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use lambdabats::config::artifact_store_url;
use lambdabats::server::Executor;
use lambdabats::store::{DirStore, HttpStore, ObjectStore};
use lambdabats::wire::{FunctionUrlRequest, FunctionUrlResponse};

#[derive(Parser)]
#[command(name = "lambdabats-executor")]
#[command(about = "Sandbox-side test executor", long_about = None)]
#[command(version)]
struct Cli {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Directory read when USE_LOCAL_DOWNLOADER is set
    #[arg(long, default_value = "/test_uploads")]
    uploads_dir: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let store: Arc<dyn ObjectStore> = if std::env::var_os("USE_LOCAL_DOWNLOADER").is_some() {
        info!(dir = %cli.uploads_dir.display(), "using local artifact downloads");
        Arc::new(DirStore::new(cli.uploads_dir.clone()))
    } else {
        let url = artifact_store_url();
        info!(%url, "using object-store artifact downloads");
        Arc::new(HttpStore::new(url))
    };

    let executor = Arc::new(Executor::new(store));

    let app = Router::new()
        .route(
            "/2015-03-31/functions/function/invocations",
            post(invoke_handler),
        )
        .with_state(executor);

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
    info!("executor listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn invoke_handler(
    State(executor): State<Arc<Executor>>,
    Json(envelope): Json<FunctionUrlRequest>,
) -> Result<Json<FunctionUrlResponse>, (StatusCode, String)> {
    match executor.handle(envelope).await {
        Ok(response) => Ok(Json(response)),
        Err(err) => {
            error!(%err, "invocation failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}
