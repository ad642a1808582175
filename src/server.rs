/// HTTP server setup and routing
use crate::{
    api::middleware::{track_metrics, SESSION_TOKEN_HEADER},
    context::AppContext,
    error::{IdpError, IdpResult},
};
use axum::{
    http::{header, HeaderName, Method, StatusCode},
    middleware,
    response::Json,
    Router,
};
use serde_json::json;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Build the main application router
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([HeaderName::from_static(SESSION_TOKEN_HEADER)]);

    Router::new()
        .merge(crate::api::routes(ctx.clone()))
        .with_state(ctx)
        .fallback(not_found)
        .layer(middleware::from_fn(track_metrics))
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Start the HTTP server; returns after a shutdown signal
pub async fn serve(ctx: AppContext) -> IdpResult<()> {
    let addr = format!("{}:{}", ctx.config.service.hostname, ctx.config.service.port);

    info!("Aurora ID listening on {}", addr);
    info!("   Issuer: {}", ctx.config.service.issuer);
    info!("   Service URL: {}", ctx.service_url());

    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| IdpError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| IdpError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
