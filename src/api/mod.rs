/// API routes and handlers
pub mod accounts;
pub mod apps;
pub mod health;
pub mod middleware;
pub mod oauth;

use crate::{
    context::AppContext,
    error::{IdpError, IdpResult},
};
use axum::Router;
use validator::Validate;

/// Build API routes
pub fn routes(ctx: AppContext) -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(accounts::routes(ctx.clone()))
        .merge(apps::routes(ctx.clone()))
        .merge(oauth::routes(ctx))
}

/// Run derive-based field checks on a request body
pub(crate) fn validate_body<T: Validate>(body: &T) -> IdpResult<()> {
    body.validate()
        .map_err(|e| IdpError::Validation(e.to_string().replace('\n', "; ")))
}
