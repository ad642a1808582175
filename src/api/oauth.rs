/// OAuth2 endpoints: authorize, token, refresh, userinfo, and the
/// app-authenticated profile lookup at `/@{id}`
use crate::{
    api::middleware::require_session,
    auth::AuthSession,
    context::AppContext,
    error::{IdpError, IdpResult},
    oauth::{AccountProfile, AuthorizationGrant, AuthorizeRequest, TokenGrant, UserInfo},
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    middleware,
    routing::{get, post},
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::Deserialize;

/// Build OAuth2 routes
pub fn routes(ctx: AppContext) -> Router<AppContext> {
    let authorize = Router::new()
        .route("/oauth2/authorize", post(authorize))
        .route_layer(middleware::from_fn_with_state(ctx, require_session));

    Router::new()
        .route("/oauth2/token", post(token))
        .route("/oauth2/refresh", post(refresh))
        .route("/oauth2/userinfo", get(userinfo))
        .route("/@:id", get(app_profile))
        .merge(authorize)
}

/// Scope bitmap as either a JSON number or a decimal string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ScopeParam {
    Bits(u64),
    Text(String),
}

impl Default for ScopeParam {
    fn default() -> Self {
        ScopeParam::Text(String::new())
    }
}

impl ScopeParam {
    fn into_string(self) -> String {
        match self {
            ScopeParam::Bits(bits) => bits.to_string(),
            ScopeParam::Text(text) => text,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeBody {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: ScopeParam,
    pub state: Option<String>,
    #[serde(default)]
    pub sig: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    #[serde(alias = "clientId")]
    pub client_id: String,
    #[serde(alias = "clientSecret")]
    pub client_secret: String,
    pub code: String,
    #[serde(alias = "redirectUri")]
    pub redirect_uri: String,
    #[serde(alias = "grantType")]
    pub grant_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshBody {
    #[serde(alias = "clientId")]
    pub client_id: String,
    #[serde(alias = "clientSecret")]
    pub client_secret: String,
    #[serde(alias = "refreshToken")]
    pub refresh_token: String,
}

async fn authorize(
    State(ctx): State<AppContext>,
    auth: AuthSession,
    Json(body): Json<AuthorizeBody>,
) -> IdpResult<Json<AuthorizationGrant>> {
    let request = AuthorizeRequest {
        client_id: body.client_id,
        redirect_uri: body.redirect_uri,
        scope: body.scope.into_string(),
        state: body.state.filter(|s| !s.is_empty()),
        sig: body.sig,
    };
    let grant = ctx.oauth.authorize(&auth.account.id, request).await?;
    Ok(Json(grant))
}

async fn token(
    State(ctx): State<AppContext>,
    Json(body): Json<TokenBody>,
) -> IdpResult<Json<TokenGrant>> {
    if let Some(grant_type) = body.grant_type.as_deref() {
        if grant_type != "authorization_code" {
            return Err(IdpError::Validation(format!(
                "Unsupported grant type: {}",
                grant_type
            )));
        }
    }

    let grant = ctx
        .oauth
        .exchange_code(
            &body.client_id,
            &body.client_secret,
            &body.code,
            &body.redirect_uri,
        )
        .await?;
    Ok(Json(grant))
}

async fn refresh(
    State(ctx): State<AppContext>,
    Json(body): Json<RefreshBody>,
) -> IdpResult<Json<TokenGrant>> {
    let grant = ctx
        .oauth
        .rotate_refresh_token(&body.client_id, &body.client_secret, &body.refresh_token)
        .await?;
    Ok(Json(grant))
}

async fn userinfo(
    State(ctx): State<AppContext>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> IdpResult<Json<UserInfo>> {
    let TypedHeader(Authorization(bearer)) =
        bearer.ok_or_else(|| IdpError::Authentication("Missing access token".to_string()))?;

    let info = ctx.oauth.userinfo(bearer.token()).await?;
    Ok(Json(info))
}

/// Client credentials from `Authorization: App <client_id>;<secret>`
fn app_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let (client_id, secret) = value.strip_prefix("App ")?.trim().split_once(';')?;
    if client_id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((client_id.to_string(), secret.to_string()))
}

async fn app_profile(
    State(ctx): State<AppContext>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> IdpResult<Json<AccountProfile>> {
    let (client_id, secret) = app_credentials(&headers)
        .ok_or_else(|| IdpError::Authentication("Missing app credentials".to_string()))?;

    let profile = ctx
        .oauth
        .profile_for_app(&client_id, &secret, &account_id)
        .await?;
    Ok(Json(profile))
}
