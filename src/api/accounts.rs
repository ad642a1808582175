/// Account, identity and TOTP endpoints
use crate::{
    account::{Account, LoginOutcome, ProfilePatch},
    api::{
        middleware::{require_session, SESSION_TOKEN_HEADER},
        validate_body,
    },
    auth::AuthSession,
    context::AppContext,
    error::IdpResult,
    identity::IdentitySummary,
};
use axum::{
    extract::{Path, State},
    middleware,
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use validator::Validate;

/// Build account routes
pub fn routes(ctx: AppContext) -> Router<AppContext> {
    let authenticated = Router::new()
        .route("/api/accounts/logout", post(logout))
        .route("/api/accounts/me", get(me))
        .route("/api/accounts/modify", patch(modify))
        .route("/api/accounts/username", patch(change_username))
        .route("/api/accounts/delete", delete(delete_account))
        .route("/api/accounts/identities", get(list_identities))
        .route("/api/accounts/identities/:id", delete(delete_identity))
        .route("/api/accounts/identities/password/add", post(add_password))
        .route("/api/accounts/identities/password/change", post(change_password))
        .route("/api/accounts/totp/start", post(totp_start))
        .route("/api/accounts/totp/finalize", post(totp_finalize))
        .route("/api/accounts/totp/remove", post(totp_remove))
        .route_layer(middleware::from_fn_with_state(ctx, require_session));

    Router::new()
        .route("/api/accounts/create", post(create_account))
        .route("/api/accounts/login", post(login))
        .merge(authenticated)
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    #[validate(length(min = 3, max = 32))]
    pub username: String,
    pub display_name: Option<String>,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountResponse {
    pub account_id: String,
    pub username: String,
    pub token: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1))]
    pub username: String,
    #[validate(length(min = 1))]
    pub password: String,
    pub totp: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    #[serde(rename = "requiresTOTP")]
    pub requires_totp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyProfileRequest {
    pub display_name: Option<String>,
    pub avatar_hash: Option<String>,
    pub pronouns: Option<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChangeUsernameRequest {
    #[validate(length(min = 3, max = 32))]
    pub username: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddPasswordRequest {
    #[validate(length(min = 8, max = 128))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub password: String,
    #[validate(length(min = 8, max = 128))]
    pub new_password: String,
    pub totp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TotpStartRequest {
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct TotpCodeRequest {
    pub password: String,
    #[validate(length(min = 1, max = 16))]
    pub code: String,
}

/// Public account view
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub avatar_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pronouns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    pub created_at: i64,
}

impl From<Account> for AccountView {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            username: account.username,
            display_name: account.display_name,
            avatar_hash: account.avatar_hash,
            pronouns: account.pronouns,
            bio: account.bio,
            created_at: account.created_at,
        }
    }
}

async fn create_account(
    State(ctx): State<AppContext>,
    Json(req): Json<CreateAccountRequest>,
) -> IdpResult<Json<CreateAccountResponse>> {
    ctx.rate_limiter.check_credentials()?;
    validate_body(&req)?;

    let (account, issued) = ctx
        .accounts
        .register_with_password(&req.username, req.display_name, &req.password)
        .await?;

    tracing::info!(account_id = %account.id, "Account registered over HTTP");
    Ok(Json(CreateAccountResponse {
        account_id: account.id,
        username: account.username,
        token: issued.token,
    }))
}

async fn login(
    State(ctx): State<AppContext>,
    Json(req): Json<LoginRequest>,
) -> IdpResult<Json<LoginResponse>> {
    ctx.rate_limiter.check_credentials()?;
    validate_body(&req)?;

    let outcome = ctx
        .accounts
        .login_with_password(&req.username, &req.password, req.totp.as_deref())
        .await?;

    Ok(Json(match outcome {
        LoginOutcome::TotpRequired => LoginResponse {
            success: true,
            requires_totp: true,
            account_id: None,
            token: None,
        },
        LoginOutcome::Session { account, issued } => LoginResponse {
            success: true,
            requires_totp: false,
            account_id: Some(account.id),
            token: Some(issued.token),
        },
    }))
}

async fn logout(State(ctx): State<AppContext>, auth: AuthSession) -> IdpResult<Json<Value>> {
    ctx.sessions.logout(&auth.session.id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn me(State(ctx): State<AppContext>, auth: AuthSession) -> IdpResult<Json<Value>> {
    let identities: Vec<IdentitySummary> = ctx
        .accounts
        .list_identities(&auth.account.id)
        .await?
        .iter()
        .map(|identity| identity.summary())
        .collect();

    Ok(Json(json!({
        "account": AccountView::from(auth.account),
        "identities": identities,
        "session": {
            "id": auth.session.id,
            "expiresAt": auth.session.expires_at,
        },
    })))
}

async fn modify(
    State(ctx): State<AppContext>,
    auth: AuthSession,
    Json(req): Json<ModifyProfileRequest>,
) -> IdpResult<Json<AccountView>> {
    let patch = ProfilePatch {
        display_name: req.display_name,
        avatar_hash: req.avatar_hash,
        pronouns: req.pronouns,
        bio: req.bio,
    };
    let account = ctx.accounts.update_profile(&auth.account.id, patch).await?;
    Ok(Json(account.into()))
}

async fn change_username(
    State(ctx): State<AppContext>,
    auth: AuthSession,
    Json(req): Json<ChangeUsernameRequest>,
) -> IdpResult<Json<AccountView>> {
    validate_body(&req)?;
    let account = ctx
        .accounts
        .change_username(&auth.account.id, &req.username)
        .await?;
    Ok(Json(account.into()))
}

async fn delete_account(State(ctx): State<AppContext>, auth: AuthSession) -> IdpResult<Json<Value>> {
    ctx.accounts.delete(&auth.account.id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn list_identities(State(ctx): State<AppContext>, auth: AuthSession) -> IdpResult<Json<Value>> {
    let identities: Vec<IdentitySummary> = ctx
        .accounts
        .list_identities(&auth.account.id)
        .await?
        .iter()
        .map(|identity| identity.summary())
        .collect();
    Ok(Json(json!({ "identities": identities })))
}

async fn delete_identity(
    State(ctx): State<AppContext>,
    auth: AuthSession,
    Path(identity_id): Path<String>,
) -> IdpResult<Json<Value>> {
    ctx.accounts
        .delete_identity(&auth.account.id, &identity_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn add_password(
    State(ctx): State<AppContext>,
    auth: AuthSession,
    Json(req): Json<AddPasswordRequest>,
) -> IdpResult<Json<IdentitySummary>> {
    validate_body(&req)?;
    let identity = ctx
        .accounts
        .add_password(&auth.account.id, &req.password)
        .await?;
    Ok(Json(identity.summary()))
}

async fn change_password(
    State(ctx): State<AppContext>,
    auth: AuthSession,
    Json(req): Json<ChangePasswordRequest>,
) -> IdpResult<Json<Value>> {
    validate_body(&req)?;
    ctx.accounts
        .change_password(
            &auth.account.id,
            &req.password,
            &req.new_password,
            req.totp.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// The extended session travels back in the session token header
async fn totp_start(
    State(ctx): State<AppContext>,
    auth: AuthSession,
    Json(req): Json<TotpStartRequest>,
) -> IdpResult<impl IntoResponse> {
    let setup = ctx
        .totp
        .start_setup(&auth.session, &auth.account.username, &req.password)
        .await?;
    Ok((
        [(SESSION_TOKEN_HEADER, setup.session_token.clone())],
        Json(setup),
    ))
}

async fn totp_finalize(
    State(ctx): State<AppContext>,
    auth: AuthSession,
    Json(req): Json<TotpCodeRequest>,
) -> IdpResult<impl IntoResponse> {
    ctx.rate_limiter.check_credentials()?;
    validate_body(&req)?;
    let token = ctx
        .totp
        .finalize_setup(&auth.session, &req.password, &req.code)
        .await?;
    Ok((
        [(SESSION_TOKEN_HEADER, token)],
        Json(json!({ "success": true })),
    ))
}

async fn totp_remove(
    State(ctx): State<AppContext>,
    auth: AuthSession,
    Json(req): Json<TotpCodeRequest>,
) -> IdpResult<Json<Value>> {
    validate_body(&req)?;
    ctx.totp.remove(&auth.session, &req.password, &req.code).await?;
    Ok(Json(json!({ "success": true })))
}
