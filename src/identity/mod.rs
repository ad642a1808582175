/// Login identities
///
/// An account logs in through one or more identities: a local password or a
/// federated provider account. Federated identities are periodically
/// re-validated against the provider's profile endpoint.

pub mod refresh;
pub mod store;

pub use refresh::{
    HttpProfileSource, IdentityRefreshHandler, ProfileError, ProfileSource, ProviderTokens,
};
pub use store::IdentityStore;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identities by id
pub const IDENTITIES: &str = "identities";
/// `"{provider}:{provider_id}"` -> identity id
pub const PROVIDER_INDEX: &str = "identity_provider_index";
/// `(account_id, identity_id)` pairs
pub const ACCOUNT_IDENTITY_INDEX: &str = "account_identity_index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Password,
    Discord,
    Github,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Password => "password",
            Provider::Discord => "discord",
            Provider::Github => "github",
            Provider::Google => "google",
        }
    }

    /// Providers whose profile is re-fetched on a schedule
    pub fn is_refreshable(&self) -> bool {
        matches!(self, Provider::Discord | Provider::Github)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Committed second factor on a password identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotpEnrollment {
    /// Seed sealed with the master key, bound to the identity id
    pub secret: String,
    /// Argon2 hashes of the backup codes not yet used
    pub backup_code_hashes: Vec<String>,
}

/// Provider payload; the tag is stored next to the common fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum IdentityData {
    Password {
        password_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        totp: Option<TotpEnrollment>,
    },
    Discord {
        username: String,
        #[serde(default)]
        avatar_hash: Option<String>,
        access_token: String,
        refresh_token: String,
    },
    Github {
        username: String,
        #[serde(default)]
        avatar_url: Option<String>,
        access_token: String,
    },
    Google {
        email: String,
        #[serde(default)]
        full_name: Option<String>,
        #[serde(default)]
        avatar_url: Option<String>,
    },
}

impl IdentityData {
    pub fn provider(&self) -> Provider {
        match self {
            IdentityData::Password { .. } => Provider::Password,
            IdentityData::Discord { .. } => Provider::Discord,
            IdentityData::Github { .. } => Provider::Github,
            IdentityData::Google { .. } => Provider::Google,
        }
    }

    /// Provider-side handle; `None` for passwords
    pub fn external_name(&self) -> Option<&str> {
        match self {
            IdentityData::Password { .. } => None,
            IdentityData::Discord { username, .. } | IdentityData::Github { username, .. } => {
                Some(username)
            }
            IdentityData::Google { email, .. } => Some(email),
        }
    }

    pub fn totp(&self) -> Option<&TotpEnrollment> {
        match self {
            IdentityData::Password { totp, .. } => totp.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub account_id: String,
    /// Provider-scoped external id; the account id for passwords
    pub provider_id: String,
    pub created_at: i64,
    #[serde(default)]
    pub last_used_at: Option<i64>,
    #[serde(default)]
    pub last_refreshed_at: Option<i64>,
    #[serde(flatten)]
    pub data: IdentityData,
}

impl Identity {
    pub fn provider(&self) -> Provider {
        self.data.provider()
    }

    pub fn lookup_key(&self) -> String {
        provider_key(self.provider(), &self.provider_id)
    }

    pub fn totp_enabled(&self) -> bool {
        self.data.totp().is_some()
    }

    /// Public view, without hashes, sealed secrets or provider tokens
    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id.clone(),
            provider: self.provider(),
            provider_id: self.provider_id.clone(),
            name: self.data.external_name().map(str::to_string),
            totp_enabled: self.totp_enabled(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySummary {
    pub id: String,
    pub provider: Provider,
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub totp_enabled: bool,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
}

pub fn provider_key(provider: Provider, provider_id: &str) -> String {
    format!("{}:{}", provider, provider_id)
}
