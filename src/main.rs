use llmgate::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,llmgate=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = llmgate::app::load_state().await?;
    let background = state.spawn_background();
    let app = llmgate::app::build_app(state.clone());
    let addr: std::net::SocketAddr =
        state
            .runtime
            .listen
            .parse()
            .map_err(|err: std::net::AddrParseError| {
                AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "listen_invalid",
                    err.to_string(),
                )
            })?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "listen_failed",
            err.to_string(),
        )
    })?;
    tracing::info!("listening on {}", addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "serve_failed",
                err.to_string(),
            )
        });
    background.shutdown().await;
    tracing::info!("shutdown complete");
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
