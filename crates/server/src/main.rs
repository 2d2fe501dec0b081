use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parsec_server::{build_router, cli, startup};

fn load_config() -> parsec_core::Config {
    parsec_core::config::load_dotenv();
    parsec_core::Config::from_env()
}

async fn serve(config: &parsec_core::Config) -> anyhow::Result<()> {
    config.validate().context("configuration error")?;
    config.log_summary();

    let provider = parsec_llm::create_tool_provider(&config.llm)?;
    let state = startup::build_app_state(config, provider)?;
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if cli::dispatch(&args)? {
        return Ok(());
    }

    let config = load_config();
    serve(&config).await
}
