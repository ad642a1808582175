/// Authentication extractors
use crate::{
    account::Account,
    api::middleware::verified_session,
    context::AppContext,
    error::IdpError,
    session::Session,
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

/// Authenticated caller, resolved by the session middleware
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub session: Session,
    pub account: Account,
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthSession {
    type Rejection = IdpError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let verified = verified_session(&parts.extensions)
            .ok_or_else(|| IdpError::Authentication("Missing authorization header".to_string()))?;

        Ok(AuthSession {
            session: verified.session.clone(),
            account: verified.account.clone(),
        })
    }
}

/// Authenticated caller whose username is on the admin list
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub session: Session,
    pub account: Account,
}

#[async_trait]
impl FromRequestParts<AppContext> for AdminSession {
    type Rejection = IdpError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let auth = AuthSession::from_request_parts(parts, state).await?;

        if !state.config.is_admin(&auth.account.username) {
            tracing::warn!(account_id = %auth.account.id, "Non-admin attempted an admin operation");
            return Err(IdpError::Authorization("Admin role required".to_string()));
        }

        Ok(AdminSession {
            session: auth.session,
            account: auth.account,
        })
    }
}
