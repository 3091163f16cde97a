use tokio::net::TcpListener;
use tracing::info;
use news_bias_api::{
    config::Config,
    api::routes::create_router,
    telemetry::init_tracing,
    AppState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;
    init_tracing("info");

    let server_addr = config.server_addr;
    info!(
        backend = ?config.model.backend,
        model = %config.model.model,
        "Starting server on {}",
        server_addr
    );

    let app_state = AppState::from_config(config)?;
    let app = create_router(app_state);

    let listener = TcpListener::bind(server_addr).await?;
    info!("Listening on {}", server_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
