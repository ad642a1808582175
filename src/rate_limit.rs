/// Rate limiting for credential endpoints
use crate::{
    config::RateLimitConfig,
    error::{IdpError, IdpResult},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::{num::NonZeroU32, sync::Arc};

/// Process-wide limiter on password guessing surfaces (login, registration,
/// TOTP confirmation)
#[derive(Clone)]
pub struct RateLimiter {
    credentials: Option<Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { credentials: None };
        }

        let per_minute =
            NonZeroU32::new(config.credential_attempts_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(per_minute).allow_burst(burst);

        Self {
            credentials: Some(Arc::new(GovernorLimiter::direct(quota))),
        }
    }

    /// Check the credential attempt budget
    pub fn check_credentials(&self) -> IdpResult<()> {
        let Some(limiter) = &self.credentials else {
            return Ok(());
        };

        match limiter.check() {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!("Credential rate limit exceeded");
                Err(IdpError::RateLimitExceeded {
                    retry_after: std::time::Duration::from_secs(1),
                })
            }
        }
    }
}
