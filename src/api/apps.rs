/// Admin endpoints for OAuth client applications
use crate::{
    api::{middleware::require_session, validate_body},
    auth::AdminSession,
    context::AppContext,
    error::{IdpError, IdpResult},
    oauth::{ApplicationUpdate, ApplicationView},
};
use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

/// Build application admin routes
pub fn routes(ctx: AppContext) -> Router<AppContext> {
    Router::new()
        .route(
            "/api/apps",
            get(list_apps)
                .post(create_app)
                .patch(update_app)
                .delete(delete_app),
        )
        .route("/api/apps/secret", post(rotate_secret))
        .route("/api/oauth/sign", post(sign_params))
        .route_layer(middleware::from_fn_with_state(ctx, require_session))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateAppRequest {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateAppResponse {
    pub app: ApplicationView,
    /// Shown once
    pub secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAppRequest {
    pub id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub redirect_uris: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct AppIdRequest {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct SignRequest {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: String,
}

async fn list_apps(
    State(ctx): State<AppContext>,
    _admin: AdminSession,
) -> IdpResult<Json<Value>> {
    let apps: Vec<ApplicationView> = ctx
        .oauth
        .applications()
        .list()
        .await?
        .iter()
        .map(|app| app.view())
        .collect();
    Ok(Json(json!({ "apps": apps })))
}

async fn create_app(
    State(ctx): State<AppContext>,
    admin: AdminSession,
    Json(req): Json<CreateAppRequest>,
) -> IdpResult<Json<CreateAppResponse>> {
    validate_body(&req)?;
    let (app, secret) = ctx
        .oauth
        .applications()
        .create(&req.name, req.description)
        .await?;

    tracing::info!(client_id = %app.id, admin = %admin.account.username, "Application registered");
    Ok(Json(CreateAppResponse {
        app: app.view(),
        secret,
    }))
}

async fn update_app(
    State(ctx): State<AppContext>,
    _admin: AdminSession,
    Json(req): Json<UpdateAppRequest>,
) -> IdpResult<Json<ApplicationView>> {
    let update = ApplicationUpdate {
        name: req.name,
        description: req.description,
        redirect_uris: req.redirect_uris,
    };
    let app = ctx.oauth.applications().update(&req.id, update).await?;
    Ok(Json(app.view()))
}

async fn delete_app(
    State(ctx): State<AppContext>,
    admin: AdminSession,
    Json(req): Json<AppIdRequest>,
) -> IdpResult<Json<Value>> {
    if !ctx.oauth.delete_application(&req.id).await? {
        return Err(IdpError::NotFound("Application not found".to_string()));
    }
    tracing::info!(client_id = %req.id, admin = %admin.account.username, "Application removed");
    Ok(Json(json!({ "success": true })))
}

async fn rotate_secret(
    State(ctx): State<AppContext>,
    _admin: AdminSession,
    Json(req): Json<AppIdRequest>,
) -> IdpResult<Json<Value>> {
    let secret = ctx.oauth.applications().rotate_secret(&req.id).await?;
    Ok(Json(json!({ "secret": secret })))
}

async fn sign_params(
    State(ctx): State<AppContext>,
    _admin: AdminSession,
    Json(req): Json<SignRequest>,
) -> IdpResult<Json<Value>> {
    let sig = ctx
        .oauth
        .sign_params(&req.redirect_uri, &req.scope, &req.client_id)?;
    Ok(Json(json!({ "sig": sig })))
}
