use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use dashboard_assistant::build_router;
use dashboard_assistant::config::{Settings, StoreSettings};
use dashboard_assistant::server::{AppState, create_router};

#[derive(Parser)]
#[command(
    name = "dashboard-assistant",
    about = "Conversational assistant over personal dashboard data"
)]
struct Args {
    /// Listen address (overrides ASSISTANT_BIND)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Fixture file for the in-process store (overrides ASSISTANT_FIXTURE)
    #[arg(long)]
    fixture: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_env()?;
    if let Some(bind) = args.bind {
        settings.bind = bind;
    }
    if let Some(path) = args.fixture {
        settings.store = StoreSettings::Fixture { path };
    }

    // Fails early when the provider's API key is missing.
    let router = build_router(&settings)?;

    let app = create_router(AppState::new(router, &settings.session_cookie));
    let listener = tokio::net::TcpListener::bind(settings.bind).await?;
    info!(addr = %settings.bind, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
