/// Authorization codes, token issuance and refresh rotation
use super::{
    applications::{Application, ApplicationStore, AuthCode},
    scope::ScopeSet,
};
use crate::{
    account::{Account, AccountManager},
    clock,
    config::PolicyConfig,
    crypto::{random_hex, signing::ParamSigner, tokens::TokenSigner},
    error::{IdpError, IdpResult},
    identity::{IdentityStore, IdentitySummary},
    metrics,
    scheduler::{EventHandler, EventPayload, EventScheduler, ScheduledEvent},
    store::{RecordStore, Table},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Refresh tokens by value
pub const REFRESH_TOKENS: &str = "refresh_tokens";

const AUTH_CODE_BYTES: usize = 20;
const REFRESH_TOKEN_BYTES: usize = 32;
const INVALID_REFRESH: &str = "Invalid or expired refresh token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshToken {
    pub client_id: String,
    pub user_id: String,
    pub scope: ScopeSet,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub expiry_event_id: Option<String>,
}

/// Parameters of an authorize call, as signed by the admin endpoint
#[derive(Debug, Clone, Default)]
pub struct AuthorizeRequest {
    pub client_id: String,
    pub redirect_uri: String,
    /// Decimal scope bitmap
    pub scope: String,
    pub state: Option<String>,
    pub sig: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationGrant {
    pub code: String,
    pub redirect_to: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub refresh_token: String,
    pub scope: String,
}

/// Profile fields released under the `identify` scope
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub avatar_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pronouns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl UserProfile {
    fn of(account: &Account) -> Self {
        Self {
            username: account.username.clone(),
            display_name: account.display_name.clone(),
            avatar_hash: account.avatar_hash.clone(),
            pronouns: account.pronouns.clone(),
            bio: account.bio.clone(),
        }
    }
}

/// Profile served to an application holding its client secret
#[derive(Debug, Clone, Serialize)]
pub struct AccountProfile {
    pub id: String,
    #[serde(flatten)]
    pub profile: UserProfile,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub id: String,
    pub scope: Vec<&'static str>,
    #[serde(flatten)]
    pub profile: Option<UserProfile>,
    pub identities: Vec<IdentitySummary>,
}

pub struct OAuthEngine {
    apps: Arc<ApplicationStore>,
    accounts: Arc<AccountManager>,
    identities: Arc<IdentityStore>,
    refresh_tokens: Table<RefreshToken>,
    scheduler: Arc<EventScheduler>,
    signer: Arc<TokenSigner>,
    param_signer: ParamSigner,
    policy: PolicyConfig,
}

impl OAuthEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: RecordStore,
        apps: Arc<ApplicationStore>,
        accounts: Arc<AccountManager>,
        identities: Arc<IdentityStore>,
        scheduler: Arc<EventScheduler>,
        signer: Arc<TokenSigner>,
        param_signer: ParamSigner,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            apps,
            accounts,
            identities,
            refresh_tokens: Table::new(store, REFRESH_TOKENS),
            scheduler,
            signer,
            param_signer,
            policy,
        }
    }

    pub fn applications(&self) -> &ApplicationStore {
        &self.apps
    }

    /// Signature an admin hands to a client for its authorize link
    pub fn sign_params(&self, redirect_uri: &str, scope: &str, client_id: &str) -> IdpResult<String> {
        if redirect_uri.is_empty() || scope.is_empty() || client_id.is_empty() {
            return Err(IdpError::Validation("Missing required parameters".to_string()));
        }
        self.param_signer.sign(redirect_uri, scope, client_id)
    }

    /// Issue a single-use code for `account_id` and record the grant
    pub async fn authorize(&self, account_id: &str, request: AuthorizeRequest) -> IdpResult<AuthorizationGrant> {
        if request.client_id.is_empty()
            || request.redirect_uri.is_empty()
            || request.scope.is_empty()
            || request.sig.is_empty()
        {
            return Err(IdpError::Validation("Missing required parameters".to_string()));
        }

        self.param_signer.verify(
            &request.redirect_uri,
            &request.scope,
            &request.client_id,
            &request.sig,
        )?;
        let scope = ScopeSet::parse(&request.scope)?;

        let app = self.registered_client(&request.client_id).await?;
        check_redirect(&app, &request.redirect_uri)?;

        let code = random_hex(AUTH_CODE_BYTES);
        let now = clock::now_ms();
        let expires_at = now + clock::duration_ms(self.policy.auth_code_ttl);
        let event_id = self
            .scheduler
            .schedule(
                EventPayload::DeleteAuthCode {
                    client_id: app.id.clone(),
                    code: code.clone(),
                },
                expires_at,
            )
            .await?;

        let grant = AuthCode {
            user_id: account_id.to_string(),
            scope,
            redirect_uri: request.redirect_uri.clone(),
            created_at: now,
            expires_at,
            expiry_event_id: Some(event_id.clone()),
        };
        if let Err(e) = self.store_code(&request.client_id, &code, grant).await {
            self.scheduler.cancel(&event_id).await?;
            return Err(e);
        }

        self.accounts
            .add_authorized_app(account_id, &request.client_id)
            .await?;

        metrics::record_token_issued("authorization_code");
        info!(client_id = %request.client_id, account_id = %account_id, "Authorization code issued");

        Ok(AuthorizationGrant {
            redirect_to: redirect_target(&request.redirect_uri, &code, request.state.as_deref()),
            code,
        })
    }

    /// Redeem an authorization code for an access/refresh token pair
    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> IdpResult<TokenGrant> {
        self.apps.verify_secret(client_id, client_secret).await?;

        let grant = {
            let _guard = self.apps.lock_records().await;
            let mut app = self.client(client_id).await?;
            let grant = app
                .auth_codes
                .get(code)
                .cloned()
                .ok_or_else(|| IdpError::NotFound("Invalid authorization code".to_string()))?;

            // A mismatch leaves the code redeemable
            if grant.redirect_uri != redirect_uri {
                return Err(IdpError::Validation("Invalid redirect URI".to_string()));
            }

            app.auth_codes.remove(code);
            self.apps.save(&app).await?;
            grant
        };

        if let Some(event_id) = &grant.expiry_event_id {
            self.scheduler.cancel(event_id).await?;
        }
        if grant.expires_at <= clock::now_ms() {
            debug!(client_id = %client_id, "Expired authorization code presented");
            return Err(IdpError::Expired("Authorization code expired".to_string()));
        }
        if self.accounts.get_by_id(&grant.user_id).await?.is_none() {
            warn!(client_id = %client_id, user_id = %grant.user_id, "Authorization code outlived its account");
            return Err(IdpError::NotFound("Invalid authorization code".to_string()));
        }

        info!(client_id = %client_id, user_id = %grant.user_id, "Authorization code redeemed");
        self.issue_tokens(client_id, &grant.user_id, grant.scope).await
    }

    /// Trade a refresh token for a new one plus a fresh access token
    pub async fn rotate_refresh_token(
        &self,
        client_id: &str,
        client_secret: &str,
        token: &str,
    ) -> IdpResult<TokenGrant> {
        self.apps.verify_secret(client_id, client_secret).await?;

        let Some(record) = self.refresh_tokens.get(token).await? else {
            return Err(refresh_rejected(client_id, "unknown token"));
        };
        if record.client_id != client_id {
            warn!(client_id = %client_id, owner = %record.client_id, "Refresh token presented by another client");
            return Err(refresh_rejected(client_id, "client mismatch"));
        }
        if record.expires_at <= clock::now_ms() {
            self.retire_refresh_token(token, &record).await?;
            return Err(refresh_rejected(client_id, "expired"));
        }
        // Whoever deletes the record owns the rotation
        if !self.retire_refresh_token(token, &record).await? {
            return Err(refresh_rejected(client_id, "already redeemed"));
        }
        if self.accounts.get_by_id(&record.user_id).await?.is_none() {
            return Err(refresh_rejected(client_id, "account deleted"));
        }

        debug!(client_id = %client_id, user_id = %record.user_id, "Refresh token rotated");
        self.issue_tokens(client_id, &record.user_id, record.scope).await
    }

    /// Resolve an access token to what the user agreed to share
    pub async fn userinfo(&self, access_token: &str) -> IdpResult<UserInfo> {
        let claims = self.signer.verify_access(access_token)?;
        let scope = ScopeSet::parse(&claims.scope)?;

        let account = self
            .accounts
            .get_by_id(&claims.sub)
            .await?
            .ok_or_else(|| IdpError::NotFound("Account not found".to_string()))?;
        if !account.has_authorized(&claims.aud) {
            return Err(IdpError::Authorization("App not authorized by user".to_string()));
        }

        let identities = self
            .identities
            .list_for_account(&account.id)
            .await?
            .into_iter()
            .filter(|identity| scope.grants_provider(identity.provider()))
            .map(|identity| identity.summary())
            .collect();

        let profile = scope.contains("identify").then(|| UserProfile::of(&account));

        Ok(UserInfo {
            id: account.id,
            scope: scope.names(),
            profile,
            identities,
        })
    }

    /// Look up a user on behalf of an app the user has authorized
    pub async fn profile_for_app(
        &self,
        client_id: &str,
        client_secret: &str,
        account_id: &str,
    ) -> IdpResult<AccountProfile> {
        let app = self.apps.verify_secret(client_id, client_secret).await?;

        let account = self
            .accounts
            .get_by_id(account_id)
            .await?
            .ok_or_else(|| IdpError::NotFound("Account not found".to_string()))?;
        if !account.has_authorized(&app.id) {
            return Err(IdpError::Authorization("App not authorized by user".to_string()));
        }

        Ok(AccountProfile {
            profile: UserProfile::of(&account),
            id: account.id,
        })
    }

    /// Delete an application and retire its outstanding codes
    pub async fn delete_application(&self, client_id: &str) -> IdpResult<bool> {
        let Some(app) = self.apps.delete(client_id).await? else {
            return Ok(false);
        };
        for grant in app.auth_codes.values() {
            if let Some(event_id) = &grant.expiry_event_id {
                self.scheduler.cancel(event_id).await?;
            }
        }
        Ok(true)
    }

    /// `delete_auth_code` delivery
    pub async fn expire_code(&self, client_id: &str, code: &str) -> IdpResult<bool> {
        let _guard = self.apps.lock_records().await;
        let Some(mut app) = self.apps.get(client_id).await? else {
            return Ok(false);
        };
        let due = app
            .auth_codes
            .get(code)
            .map(|grant| grant.expires_at <= clock::now_ms())
            .unwrap_or(false);
        if !due {
            return Ok(false);
        }

        app.auth_codes.remove(code);
        self.apps.save(&app).await?;
        Ok(true)
    }

    /// `delete_refresh_token` delivery
    pub async fn expire_refresh_token(&self, token: &str) -> IdpResult<bool> {
        match self.refresh_tokens.get(token).await? {
            Some(record) if record.expires_at <= clock::now_ms() => {
                self.refresh_tokens.delete(token).await
            }
            _ => Ok(false),
        }
    }

    pub async fn get_refresh_token(&self, token: &str) -> IdpResult<Option<RefreshToken>> {
        self.refresh_tokens.get(token).await
    }

    async fn registered_client(&self, client_id: &str) -> IdpResult<Application> {
        self.apps
            .get(client_id)
            .await?
            .ok_or_else(|| IdpError::NotFound("Invalid client".to_string()))
    }

    /// Add a code to the client's map, re-checking the client under the lock
    async fn store_code(&self, client_id: &str, code: &str, grant: AuthCode) -> IdpResult<()> {
        let _guard = self.apps.lock_records().await;
        let mut app = self.registered_client(client_id).await?;
        check_redirect(&app, &grant.redirect_uri)?;
        app.auth_codes.insert(code.to_string(), grant);
        self.apps.save(&app).await
    }

    async fn client(&self, client_id: &str) -> IdpResult<Application> {
        self.apps
            .get(client_id)
            .await?
            .ok_or_else(|| IdpError::Authentication("Invalid client credentials".to_string()))
    }

    async fn issue_tokens(&self, client_id: &str, user_id: &str, scope: ScopeSet) -> IdpResult<TokenGrant> {
        let (access_token, _) =
            self.signer
                .sign_access(user_id, client_id, scope.bits(), self.policy.access_token_ttl)?;

        let token = random_hex(REFRESH_TOKEN_BYTES);
        let now = clock::now_ms();
        let expires_at = now + clock::duration_ms(self.policy.refresh_token_ttl);
        let event_id = self
            .scheduler
            .schedule(
                EventPayload::DeleteRefreshToken {
                    token: token.clone(),
                },
                expires_at,
            )
            .await?;
        let record = RefreshToken {
            client_id: client_id.to_string(),
            user_id: user_id.to_string(),
            scope,
            created_at: now,
            expires_at,
            expiry_event_id: Some(event_id),
        };
        self.refresh_tokens.set(&token, &record).await?;

        metrics::record_token_issued("access_token");
        metrics::record_token_issued("refresh_token");

        Ok(TokenGrant {
            access_token,
            token_type: "Bearer",
            expires_in: self.policy.access_token_ttl.as_secs(),
            refresh_token: token,
            scope: scope.to_string(),
        })
    }

    async fn retire_refresh_token(&self, token: &str, record: &RefreshToken) -> IdpResult<bool> {
        let removed = self.refresh_tokens.delete(token).await?;
        if removed {
            if let Some(event_id) = &record.expiry_event_id {
                self.scheduler.cancel(event_id).await?;
            }
        }
        Ok(removed)
    }
}

fn check_redirect(app: &Application, redirect_uri: &str) -> IdpResult<()> {
    if !app.allows_redirect(redirect_uri) {
        return Err(IdpError::Validation("Invalid redirect_uri".to_string()));
    }
    Ok(())
}

fn refresh_rejected(client_id: &str, reason: &str) -> IdpError {
    debug!(client_id = %client_id, reason, "Refresh token rejected");
    IdpError::Authentication(INVALID_REFRESH.to_string())
}

fn redirect_target(redirect_uri: &str, code: &str, state: Option<&str>) -> String {
    let separator = if redirect_uri.contains('?') { '&' } else { '?' };
    let mut target = format!("{}{}code={}", redirect_uri, separator, code);
    if let Some(state) = state {
        target.push_str("&state=");
        target.push_str(&urlencoding::encode(state));
    }
    target
}

/// Handles `delete_auth_code` events
pub struct AuthCodeExpiryHandler {
    engine: Arc<OAuthEngine>,
}

impl AuthCodeExpiryHandler {
    pub fn new(engine: Arc<OAuthEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EventHandler for AuthCodeExpiryHandler {
    async fn handle(&self, event: &ScheduledEvent) -> IdpResult<()> {
        let EventPayload::DeleteAuthCode { client_id, code } = &event.payload else {
            warn!(event_id = %event.id, "Auth code handler received a foreign event");
            return Ok(());
        };
        if self.engine.expire_code(client_id, code).await? {
            debug!(client_id = %client_id, "Authorization code expired unused");
        }
        Ok(())
    }
}

/// Handles `delete_refresh_token` events
pub struct RefreshTokenExpiryHandler {
    engine: Arc<OAuthEngine>,
}

impl RefreshTokenExpiryHandler {
    pub fn new(engine: Arc<OAuthEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EventHandler for RefreshTokenExpiryHandler {
    async fn handle(&self, event: &ScheduledEvent) -> IdpResult<()> {
        let EventPayload::DeleteRefreshToken { token } = &event.payload else {
            warn!(event_id = %event.id, "Refresh token handler received a foreign event");
            return Ok(());
        };
        if self.engine.expire_refresh_token(token).await? {
            debug!("Refresh token expired unused");
        }
        Ok(())
    }
}
