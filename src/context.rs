/// Application context and dependency injection
use crate::{
    account::AccountManager,
    config::ServerConfig,
    crypto::{secret_box::SecretBox, signing::ParamSigner, tokens::TokenSigner},
    db,
    error::{IdpError, IdpResult},
    identity::{HttpProfileSource, IdentityRefreshHandler, IdentityStore, ProfileSource},
    oauth::{ApplicationStore, AuthCodeExpiryHandler, OAuthEngine, RefreshTokenExpiryHandler},
    rate_limit::RateLimiter,
    scheduler::{EventKind, EventScheduler},
    session::{SessionExpiryHandler, SessionManager},
    store::RecordStore,
    totp::TotpManager,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub store: RecordStore,
    pub scheduler: Arc<EventScheduler>,
    pub signer: Arc<TokenSigner>,
    pub sessions: Arc<SessionManager>,
    pub identities: Arc<IdentityStore>,
    pub totp: Arc<TotpManager>,
    pub accounts: Arc<AccountManager>,
    pub oauth: Arc<OAuthEngine>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> IdpResult<Self> {
        config.validate()?;
        Self::ensure_directories(&config).await?;

        let pool = db::create_pool(&config.storage.database, db::DatabaseOptions::default()).await?;
        db::run_migrations(&pool).await?;
        db::test_connection(&pool).await?;

        Self::with_pool(config, pool)
    }

    /// Wire services over an already migrated pool
    pub fn with_pool(config: ServerConfig, pool: SqlitePool) -> IdpResult<Self> {
        let profiles = Arc::new(HttpProfileSource::new(config.providers.clone())?);
        Self::with_profile_source(config, pool, profiles)
    }

    pub fn with_profile_source(
        config: ServerConfig,
        pool: SqlitePool,
        profiles: Arc<dyn ProfileSource>,
    ) -> IdpResult<Self> {
        let auth = &config.authentication;
        let policy = config.policy.clone();

        let signer = Arc::new(TokenSigner::from_pem(
            &auth.jwt_private_key_pem,
            &auth.jwt_public_key_pem,
            &config.service.issuer,
        )?);
        let sealer = SecretBox::from_hex(&auth.totp_master_key)?;
        let param_signer = ParamSigner::new(&auth.oauth_sign_secret);

        let store = RecordStore::new(pool.clone());
        let scheduler = EventScheduler::new(store.clone(), policy.max_timer_delay);

        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            scheduler.clone(),
            signer.clone(),
            policy.clone(),
        )?);
        let identities = Arc::new(IdentityStore::new(
            store.clone(),
            sessions.clone(),
            scheduler.clone(),
            policy.clone(),
        ));
        let totp = Arc::new(TotpManager::new(
            store.clone(),
            identities.clone(),
            sessions.clone(),
            sealer,
            auth.totp_issuer.clone(),
            policy.clone(),
        )?);
        let accounts = Arc::new(AccountManager::new(
            store.clone(),
            identities.clone(),
            sessions.clone(),
            totp.clone(),
        ));
        let oauth = Arc::new(OAuthEngine::new(
            store.clone(),
            Arc::new(ApplicationStore::new(store.clone())),
            accounts.clone(),
            identities.clone(),
            scheduler.clone(),
            signer.clone(),
            param_signer,
            policy.clone(),
        ));

        // Handlers depend on managers that hold the scheduler, so they are
        // registered once everything exists
        scheduler.register(
            EventKind::DeleteSession,
            Arc::new(SessionExpiryHandler::new(sessions.clone())),
        );
        scheduler.register(
            EventKind::DeleteAuthCode,
            Arc::new(AuthCodeExpiryHandler::new(oauth.clone())),
        );
        scheduler.register(
            EventKind::DeleteRefreshToken,
            Arc::new(RefreshTokenExpiryHandler::new(oauth.clone())),
        );
        scheduler.register(
            EventKind::RefreshIdentity,
            Arc::new(IdentityRefreshHandler::new(
                identities.clone(),
                profiles,
                scheduler.clone(),
                policy.identity_refresh_interval,
            )),
        );

        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        Ok(Self {
            config: Arc::new(config),
            db: pool,
            store,
            scheduler,
            signer,
            sessions,
            identities,
            totp,
            accounts,
            oauth,
            rate_limiter,
        })
    }

    /// Recover persisted events and arm the timer
    pub async fn start(&self) -> IdpResult<()> {
        self.scheduler.start().await
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    async fn ensure_directories(config: &ServerConfig) -> IdpResult<()> {
        let dir = &config.storage.data_directory;
        if !dir.exists() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                IdpError::Internal(format!("Failed to create directory {:?}: {}", dir, e))
            })?;
        }
        Ok(())
    }

    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}
