use crate::{ai::get_image_caption, config::ServerConfig, routes::get_routes, AppState};
use dotenvy::dotenv;
use std::net::SocketAddr;

pub async fn start_server() -> anyhow::Result<()> {
    match dotenv() {
        Ok(path) => eprintln!(".env read successfully from {}", path.display()),
        Err(e) => eprintln!("Could not load .env file: {e}"),
    };

    let config = ServerConfig::from_env()?;

    // should be after dotenv() so RUST_LOG in .env file will be loaded
    match &config.log_dir {
        Some(log_dir) => analytics_tracing::init_tracing_to_file(log_dir.clone()),
        None => analytics_tracing::init_tracing_to_stdout(),
    }
    tracing::debug!("loaded config: {:?}", config);

    let image_caption = get_image_caption(&config.model)?;
    let app = get_routes(AppState { image_caption }, config.body_limit);

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}/caption", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl-C received, shut down...");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, shut down...");
        },
    }
}
