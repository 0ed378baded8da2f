use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;
use ytgrab_engine::{
    Catalog, DEFAULT_USER_AGENT, DirectExtractor, ExternalHelper, ExtractorRegistry,
    HttpTransport, JobRunner, ProgressBus, PromptBroker, TransportConfig,
};

mod error;
mod routes;

/// Local web service over the ytgrab engine.
#[derive(Debug, Parser)]
#[command(name = "ytgrab-web", version, about)]
struct ServerArgs {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Directory all downloads are confined to.
    #[arg(long, default_value = "./downloads")]
    output_root: PathBuf,

    /// Record successful items into this SQLite catalog.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// External multiplexing helper binary.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// Directory of static frontend assets, served at `/`.
    #[arg(long, default_value = "./static")]
    static_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tokio::fs::create_dir_all(&args.output_root).await?;

    let transport = HttpTransport::new(&TransportConfig::default())?;
    let extractors = Arc::new(
        ExtractorRegistry::new().register(Arc::new(DirectExtractor::new(transport.clone()))),
    );
    let catalog = match &args.catalog {
        Some(path) => Some(Catalog::open(path).await?),
        None => None,
    };

    let bus = ProgressBus::new();
    bus.spawn_reaper();
    let runner = JobRunner::new(
        bus,
        transport,
        extractors,
        PromptBroker::new(std::time::Duration::from_secs(60)),
        Arc::new(ExternalHelper::new(&args.ffmpeg)),
        catalog,
        DEFAULT_USER_AGENT,
    );

    let state = routes::AppState {
        runner: runner.clone(),
        output_root: args.output_root.clone(),
    };

    let mut app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());
    if args.static_dir.is_dir() {
        app = app.fallback_service(ServeDir::new(&args.static_dir));
    }

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, root = %args.output_root.display(), "ytgrab-web listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down, cancelling running jobs");
            runner.shutdown();
        })
        .await?;
    Ok(())
}
