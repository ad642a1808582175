/// Health check and metrics endpoints
///
/// - `/health`: liveness with version
/// - `/health/ready`: database reachable
/// - `/health/detailed`: per-component status, including the event engine
/// - `/metrics`: Prometheus text exposition

use crate::{
    context::AppContext,
    error::{IdpError, IdpResult},
    metrics,
    scheduler::EventKind,
};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Instant;

/// Component status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub status: Status,
    pub version: String,
    pub components: Vec<Component>,
}

#[derive(Debug, Serialize)]
pub struct Component {
    pub name: &'static str,
    pub status: Status,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl Component {
    fn timed(name: &'static str, started: Instant, outcome: IdpResult<(Status, Value)>) -> Self {
        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok((status, details)) => Self {
                name,
                status,
                latency_ms,
                error: None,
                details,
            },
            Err(e) => Self {
                name,
                status: Status::Unhealthy,
                latency_ms,
                error: Some(e.to_string()),
                details: Value::Null,
            },
        }
    }
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/health/detailed", get(detailed))
        .route("/metrics", get(metrics_endpoint))
}

async fn liveness(State(ctx): State<AppContext>) -> Json<Value> {
    Json(json!({ "status": "ok", "version": ctx.config.service.version }))
}

/// Ready when the database answers
async fn readiness(State(ctx): State<AppContext>) -> Result<Json<Value>, StatusCode> {
    ping_database(&ctx).await.map_err(|e| {
        tracing::warn!(error = %e, "Readiness check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(Json(json!({ "status": "ready" })))
}

async fn detailed(State(ctx): State<AppContext>) -> (StatusCode, Json<Report>) {
    let components = vec![database_component(&ctx).await, scheduler_component(&ctx).await];
    let status = overall(&components);

    tracing::debug!(status = ?status, "Health report built");

    let code = if status == Status::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let report = Report {
        status,
        version: ctx.config.service.version.clone(),
        components,
    };
    (code, Json(report))
}

async fn metrics_endpoint() -> IdpResult<impl IntoResponse> {
    let body = metrics::render_metrics()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

async fn ping_database(ctx: &AppContext) -> IdpResult<()> {
    sqlx::query("SELECT 1").execute(&ctx.db).await?;
    Ok(())
}

async fn database_component(ctx: &AppContext) -> Component {
    let started = Instant::now();
    let outcome = ping_database(ctx)
        .await
        .map(|_| (Status::Healthy, json!({ "connections": ctx.db.size() })));
    Component::timed("database", started, outcome)
}

/// Pending events per kind; an engine with work but no timer is degraded
async fn scheduler_component(ctx: &AppContext) -> Component {
    let started = Instant::now();
    let outcome = async {
        let mut pending = serde_json::Map::new();
        let mut total = 0;
        for kind in EventKind::ALL {
            let count = ctx.scheduler.list_by_kind(kind).await?.len();
            total += count;
            pending.insert(kind.as_str().to_string(), count.into());
        }

        let armed = ctx.scheduler.is_armed();
        let status = if total > 0 && !armed {
            Status::Degraded
        } else {
            Status::Healthy
        };
        Ok::<_, IdpError>((
            status,
            json!({
                "armed": armed,
                "nextFireAt": ctx.scheduler.armed_target(),
                "pending": pending,
            }),
        ))
    }
    .await;
    Component::timed("scheduler", started, outcome)
}

fn overall(components: &[Component]) -> Status {
    components
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(Status::Healthy)
}
