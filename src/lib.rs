/// Aurora ID - identity provider and OAuth2 server
///
/// Accounts with password and federated identities, sessions with sliding
/// renewal, TOTP second factor, and an OAuth2 authorization-code flow, all
/// driven by a durable scheduled-event engine for expiry and refresh.

pub mod account;
pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod oauth;
pub mod rate_limit;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;
pub mod totp;

pub use config::ServerConfig;
pub use context::AppContext;
pub use error::{IdpError, IdpResult};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::{
        AuthConfig, LoggingConfig, PolicyConfig, ProvidersConfig, RateLimitConfig, ServerConfig,
        ServiceConfig, StorageConfig,
    };
    use crate::context::AppContext;
    use std::ops::Deref;

    pub const TEST_PRIVATE_KEY: &str = include_str!("../tests/fixtures/jwt_private.pem");
    pub const TEST_PUBLIC_KEY: &str = include_str!("../tests/fixtures/jwt_public.pem");

    pub fn test_config() -> ServerConfig {
        ServerConfig {
            service: ServiceConfig {
                hostname: "localhost".to_string(),
                port: 0,
                issuer: "https://id.test".to_string(),
                version: "test".to_string(),
            },
            storage: StorageConfig {
                data_directory: std::env::temp_dir(),
                database: ":memory:".into(),
            },
            authentication: AuthConfig {
                jwt_private_key_pem: TEST_PRIVATE_KEY.to_string(),
                jwt_public_key_pem: TEST_PUBLIC_KEY.to_string(),
                totp_master_key: "42".repeat(32),
                totp_issuer: "AuroraID Test".to_string(),
                oauth_sign_secret: "test-sign-secret-0123456789abcdef".to_string(),
                admin_usernames: vec!["admin".to_string()],
            },
            policy: PolicyConfig::default(),
            providers: ProvidersConfig::default(),
            rate_limit: RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
        }
    }

    /// Fully wired services over a private in-memory database
    ///
    /// The scheduler is not started; tests that need delivery start it.
    pub struct TestContext {
        pub app: AppContext,
    }

    impl TestContext {
        pub async fn new() -> Self {
            Self::with_policy(PolicyConfig::default()).await
        }

        pub async fn with_policy(policy: PolicyConfig) -> Self {
            let mut config = test_config();
            config.policy = policy;

            let pool = crate::db::create_memory_pool().await.unwrap();
            crate::db::run_migrations(&pool).await.unwrap();
            let app = AppContext::with_pool(config, pool).unwrap();
            Self { app }
        }
    }

    impl Deref for TestContext {
        type Target = AppContext;

        fn deref(&self) -> &AppContext {
            &self.app
        }
    }
}
