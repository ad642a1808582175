/// Configuration management for Aurora ID
use crate::error::{IdpError, IdpResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub policy: PolicyConfig,
    pub providers: ProvidersConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    /// Value of the `iss` claim, and the `aud` claim of session tokens
    pub issuer: String,
    pub version: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database: PathBuf,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// RSA private key used to sign bearer tokens (PEM)
    pub jwt_private_key_pem: String,
    /// Matching RSA public key (PEM)
    pub jwt_public_key_pem: String,
    /// 32-byte key sealing TOTP secrets at rest, hex encoded
    pub totp_master_key: String,
    /// Label shown by authenticator apps
    pub totp_issuer: String,
    /// HMAC secret for signed authorize requests
    pub oauth_sign_secret: String,
    /// Usernames allowed to manage applications
    pub admin_usernames: Vec<String>,
}

/// Temporal policy constants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub session_ttl: Duration,
    /// Sessions verified within this window before expiry are renewed
    pub session_renewal_window: Duration,
    pub pending_totp_ttl: Duration,
    /// Minimum remaining session lifetime after TOTP enrollment
    pub post_totp_session_ttl: Duration,
    pub auth_code_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub access_token_ttl: Duration,
    pub identity_refresh_interval: Duration,
    /// Longest single timer the event engine arms before chaining
    pub max_timer_delay: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        const DAY: u64 = 24 * 60 * 60;
        Self {
            session_ttl: Duration::from_secs(60 * DAY),
            session_renewal_window: Duration::from_secs(7 * DAY),
            pending_totp_ttl: Duration::from_secs(10 * 60),
            post_totp_session_ttl: Duration::from_secs(60 * 60),
            auth_code_ttl: Duration::from_secs(5 * 60),
            refresh_token_ttl: Duration::from_secs(30 * DAY),
            access_token_ttl: Duration::from_secs(60 * 60),
            identity_refresh_interval: Duration::from_secs(4 * DAY),
            max_timer_delay: Duration::from_millis(2_147_483_647),
        }
    }
}

/// Federated provider endpoints used for profile refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub discord_api_base: String,
    /// OAuth client used to renew stored Discord tokens
    pub discord_client_id: Option<String>,
    pub discord_client_secret: Option<String>,
    pub github_api_base: String,
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            discord_api_base: "https://discord.com/api/v10".to_string(),
            discord_client_id: None,
            discord_client_secret: None,
            github_api_base: "https://api.github.com".to_string(),
            user_agent: format!("aurora-id/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Login and registration attempts per minute, process-wide
    pub credential_attempts_per_minute: u32,
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            credential_attempts_per_minute: 60,
            burst_size: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> IdpResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("IDP_HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let port = env::var("IDP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| IdpError::Validation("Invalid port number".to_string()))?;
        let issuer = env::var("IDP_ISSUER").unwrap_or_else(|_| format!("https://{}", hostname));
        let version = env::var("IDP_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        let data_directory: PathBuf = env::var("IDP_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let database = env::var("IDP_DATABASE_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("aurora-id.sqlite"));

        let jwt_private_key_pem = decode_pem("IDP_JWT_PRIVATE_KEY", &required("IDP_JWT_PRIVATE_KEY")?)?;
        let jwt_public_key_pem = decode_pem("IDP_JWT_PUBLIC_KEY", &required("IDP_JWT_PUBLIC_KEY")?)?;
        let totp_master_key = required("IDP_TOTP_MASTER_KEY")?;
        let oauth_sign_secret = required("IDP_OAUTH_SIGN_SECRET")?;
        let totp_issuer = env::var("IDP_TOTP_ISSUER").unwrap_or_else(|_| "AuroraID".to_string());

        let admin_usernames = env::var("IDP_ADMIN_USERNAMES")
            .unwrap_or_else(|_| String::new())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<String>>();

        let defaults = PolicyConfig::default();
        let policy = PolicyConfig {
            session_ttl: secs_or("IDP_POLICY_SESSION_TTL_SECS", defaults.session_ttl),
            session_renewal_window: secs_or(
                "IDP_POLICY_SESSION_RENEWAL_WINDOW_SECS",
                defaults.session_renewal_window,
            ),
            pending_totp_ttl: secs_or("IDP_POLICY_PENDING_TOTP_TTL_SECS", defaults.pending_totp_ttl),
            post_totp_session_ttl: secs_or(
                "IDP_POLICY_POST_TOTP_SESSION_TTL_SECS",
                defaults.post_totp_session_ttl,
            ),
            auth_code_ttl: secs_or("IDP_POLICY_AUTH_CODE_TTL_SECS", defaults.auth_code_ttl),
            refresh_token_ttl: secs_or("IDP_POLICY_REFRESH_TOKEN_TTL_SECS", defaults.refresh_token_ttl),
            access_token_ttl: secs_or("IDP_POLICY_ACCESS_TOKEN_TTL_SECS", defaults.access_token_ttl),
            identity_refresh_interval: secs_or(
                "IDP_POLICY_IDENTITY_REFRESH_INTERVAL_SECS",
                defaults.identity_refresh_interval,
            ),
            max_timer_delay: env::var("IDP_POLICY_MAX_TIMER_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_timer_delay),
        };

        let provider_defaults = ProvidersConfig::default();
        let providers = ProvidersConfig {
            discord_api_base: env::var("IDP_DISCORD_API_BASE")
                .unwrap_or(provider_defaults.discord_api_base),
            discord_client_id: env::var("IDP_DISCORD_CLIENT_ID").ok(),
            discord_client_secret: env::var("IDP_DISCORD_CLIENT_SECRET").ok(),
            github_api_base: env::var("IDP_GITHUB_API_BASE")
                .unwrap_or(provider_defaults.github_api_base),
            user_agent: provider_defaults.user_agent,
            request_timeout: secs_or("IDP_PROVIDER_TIMEOUT_SECS", provider_defaults.request_timeout),
        };

        let rate_limit_enabled = env::var("IDP_RATE_LIMITS_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);
        let credential_attempts_per_minute = env::var("IDP_RATE_LIMIT_CREDENTIAL_ATTEMPTS_PER_MINUTE")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("IDP_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                issuer,
                version,
            },
            storage: StorageConfig {
                data_directory,
                database,
            },
            authentication: AuthConfig {
                jwt_private_key_pem,
                jwt_public_key_pem,
                totp_master_key,
                totp_issuer,
                oauth_sign_secret,
                admin_usernames,
            },
            policy,
            providers,
            rate_limit: RateLimitConfig {
                enabled: rate_limit_enabled,
                credential_attempts_per_minute,
                burst_size: RateLimitConfig::default().burst_size,
            },
            logging: LoggingConfig {
                level: log_level,
                json: log_json,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> IdpResult<()> {
        if self.service.hostname.is_empty() {
            return Err(IdpError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.service.issuer.is_empty() {
            return Err(IdpError::Startup("Issuer cannot be empty".to_string()));
        }

        let master_key = &self.authentication.totp_master_key;
        if master_key.len() != 64 || hex::decode(master_key).is_err() {
            return Err(IdpError::Startup(
                "IDP_TOTP_MASTER_KEY must be 64 hex characters".to_string(),
            ));
        }

        if self.authentication.oauth_sign_secret.len() < 32 {
            return Err(IdpError::Startup(
                "IDP_OAUTH_SIGN_SECRET must be at least 32 characters".to_string(),
            ));
        }

        if self.policy.session_renewal_window >= self.policy.session_ttl {
            return Err(IdpError::Validation(
                "Session renewal window must be shorter than the session TTL".to_string(),
            ));
        }

        if self.policy.max_timer_delay.is_zero() {
            return Err(IdpError::Validation(
                "Maximum timer delay must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether the username may manage client applications
    pub fn is_admin(&self, username: &str) -> bool {
        self.authentication
            .admin_usernames
            .iter()
            .any(|admin| admin == username)
    }
}

fn required(name: &str) -> IdpResult<String> {
    env::var(name).map_err(|_| IdpError::Startup(format!("{} is required", name)))
}

fn secs_or(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Accept a PEM document either verbatim or base64 encoded
pub fn decode_pem(name: &str, raw: &str) -> IdpResult<String> {
    let raw = raw.trim();
    if raw.starts_with("-----BEGIN") {
        return Ok(raw.to_string());
    }

    let bytes = STANDARD
        .decode(raw)
        .map_err(|e| IdpError::Startup(format!("{} is not valid base64: {}", name, e)))?;
    let pem = String::from_utf8(bytes)
        .map_err(|_| IdpError::Startup(format!("{} does not decode to text", name)))?;

    if !pem.trim_start().starts_with("-----BEGIN") {
        return Err(IdpError::Startup(format!("{} is not a PEM document", name)));
    }

    Ok(pem)
}
