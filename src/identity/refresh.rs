/// Periodic re-validation of federated identities
///
/// Each refreshable identity carries one pending `refresh_identity` event.
/// Delivery fetches the provider profile, stores what changed and schedules
/// the next round.
use super::{Identity, IdentityData, IdentityStore, Provider};
use crate::{
    clock,
    config::ProvidersConfig,
    error::{IdpError, IdpResult},
    scheduler::{EventHandler, EventPayload, EventScheduler, ScheduledEvent},
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProfileError {
    /// The provider rejected the stored credentials
    #[error("Provider revoked access: {0}")]
    Revoked(String),

    #[error("Provider unavailable: {0}")]
    Transient(String),

    #[error("No profile source for {0}")]
    Unsupported(Provider),
}

/// Renewed provider credentials, replacing the stored pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// Fields re-read from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub username: String,
    pub avatar: Option<String>,
    /// Set when the fetch had to renew the access token
    pub tokens: Option<ProviderTokens>,
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch(&self, identity: &Identity) -> Result<ProviderProfile, ProfileError>;
}

#[derive(Deserialize)]
struct DiscordUser {
    username: String,
    avatar: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

#[derive(Deserialize)]
struct GithubUser {
    login: String,
    avatar_url: Option<String>,
}

/// Provider profile endpoints over HTTP
pub struct HttpProfileSource {
    client: reqwest::Client,
    config: ProvidersConfig,
}

impl HttpProfileSource {
    pub fn new(config: ProvidersConfig) -> IdpResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IdpError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: String,
        access_token: &str,
    ) -> Result<T, ProfileError> {
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| ProfileError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ProfileError::Revoked(format!("{} returned {}", url, response.status())))
            }
            status if !status.is_success() => {
                Err(ProfileError::Transient(format!("{} returned {}", url, status)))
            }
            _ => response
                .json::<T>()
                .await
                .map_err(|e| ProfileError::Transient(format!("Malformed profile: {}", e))),
        }
    }

    /// Trade the stored Discord refresh token for a new pair
    ///
    /// `None` when no Discord client is configured; the stored access token
    /// is then used as is.
    async fn renew_discord(&self, refresh_token: &str) -> Result<Option<ProviderTokens>, ProfileError> {
        let (Some(client_id), Some(client_secret)) = (
            self.config.discord_client_id.as_deref(),
            self.config.discord_client_secret.as_deref(),
        ) else {
            return Ok(None);
        };

        let url = format!("{}/oauth2/token", self.config.discord_api_base);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| ProfileError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(grant_failure(status));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProfileError::Transient(format!("Malformed token response: {}", e)))?;

        Ok(Some(ProviderTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        }))
    }
}

/// A refused refresh grant means the user revoked us; anything else may pass
fn grant_failure(status: StatusCode) -> ProfileError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProfileError::Revoked(format!("Discord refused the refresh grant ({})", status))
        }
        status => ProfileError::Transient(format!("Discord token endpoint returned {}", status)),
    }
}

#[async_trait]
impl ProfileSource for HttpProfileSource {
    async fn fetch(&self, identity: &Identity) -> Result<ProviderProfile, ProfileError> {
        match &identity.data {
            IdentityData::Discord {
                access_token,
                refresh_token,
                ..
            } => {
                let tokens = self.renew_discord(refresh_token).await?;
                let bearer = tokens
                    .as_ref()
                    .map_or(access_token.as_str(), |t| t.access_token.as_str());

                let url = format!("{}/users/@me", self.config.discord_api_base);
                let user: DiscordUser = self.get_json(url, bearer).await?;
                Ok(ProviderProfile {
                    username: user.username,
                    avatar: user.avatar,
                    tokens,
                })
            }
            IdentityData::Github { access_token, .. } => {
                let url = format!("{}/user", self.config.github_api_base);
                let user: GithubUser = self.get_json(url, access_token).await?;
                Ok(ProviderProfile {
                    username: user.login,
                    avatar: user.avatar_url,
                    tokens: None,
                })
            }
            _ => Err(ProfileError::Unsupported(identity.provider())),
        }
    }
}

/// Handles `refresh_identity` events
pub struct IdentityRefreshHandler {
    identities: Arc<IdentityStore>,
    source: Arc<dyn ProfileSource>,
    scheduler: Arc<EventScheduler>,
    interval: Duration,
}

impl IdentityRefreshHandler {
    pub fn new(
        identities: Arc<IdentityStore>,
        source: Arc<dyn ProfileSource>,
        scheduler: Arc<EventScheduler>,
        interval: Duration,
    ) -> Self {
        Self {
            identities,
            source,
            scheduler,
            interval,
        }
    }

    async fn reschedule(&self, identity_id: &str) -> IdpResult<()> {
        self.scheduler
            .schedule(
                EventPayload::RefreshIdentity {
                    identity_id: identity_id.to_string(),
                },
                clock::from_now(self.interval),
            )
            .await?;
        Ok(())
    }
}

fn apply_profile(identity: &mut Identity, profile: ProviderProfile) {
    match &mut identity.data {
        IdentityData::Discord {
            username,
            avatar_hash,
            access_token,
            refresh_token,
        } => {
            *username = profile.username;
            *avatar_hash = profile.avatar;
            if let Some(tokens) = profile.tokens {
                *access_token = tokens.access_token;
                *refresh_token = tokens.refresh_token;
            }
        }
        IdentityData::Github {
            username,
            avatar_url,
            ..
        } => {
            *username = profile.username;
            *avatar_url = profile.avatar;
        }
        _ => {}
    }
    identity.last_refreshed_at = Some(clock::now_ms());
}

#[async_trait]
impl EventHandler for IdentityRefreshHandler {
    async fn handle(&self, event: &ScheduledEvent) -> IdpResult<()> {
        let EventPayload::RefreshIdentity { identity_id } = &event.payload else {
            warn!(event_id = %event.id, "Refresh handler received a foreign event");
            return Ok(());
        };

        let Some(mut identity) = self.identities.get_by_id(identity_id).await? else {
            debug!(identity_id = %identity_id, "Identity gone, refresh stops");
            return Ok(());
        };

        match self.source.fetch(&identity).await {
            Ok(profile) => {
                apply_profile(&mut identity, profile);
                self.identities.set_by_id(&identity).await?;
                debug!(identity_id = %identity_id, "Identity refreshed");
                self.reschedule(identity_id).await
            }
            Err(ProfileError::Transient(reason)) => {
                warn!(identity_id = %identity_id, "Identity refresh failed, retrying next round: {}", reason);
                self.reschedule(identity_id).await
            }
            Err(ProfileError::Revoked(reason)) => {
                info!(identity_id = %identity_id, "Provider revoked access, refresh stops: {}", reason);
                Ok(())
            }
            Err(e @ ProfileError::Unsupported(_)) => {
                debug!(identity_id = %identity_id, "{}", e);
                Ok(())
            }
        }
    }
}
