/// Second-factor enrollment for password identities
///
/// `no-2fa -> pending -> enrolled`, and back to `no-2fa` on removal. Pending
/// state is keyed by the session that started the flow and lives in its own
/// namespace until it is finalized, expires, or the session goes away.

use crate::{
    clock,
    config::PolicyConfig,
    crypto::{
        password::{hash_password, verify_password},
        secret_box::SecretBox,
        totp,
    },
    error::{IdpError, IdpResult},
    identity::{Identity, IdentityData, IdentityStore, TotpEnrollment},
    session::{Session, SessionManager},
    store::{Change, ChangeSubscriber, RecordStore, Table},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Pending setups by session id
pub const PENDING_TOTP: &str = "pending_totp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTotpSetup {
    pub account_id: String,
    pub identity_id: String,
    pub secret_base32: String,
    pub secret_hex: String,
    pub otpauth_url: String,
    pub backup_codes: Vec<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Shown to the user once when setup starts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TotpSetup {
    pub secret: String,
    pub otpauth_url: String,
    pub backup_codes: Vec<String>,
    pub expires_at: i64,
    /// Session token covering the extended session
    #[serde(skip)]
    pub session_token: String,
}

pub struct TotpManager {
    pending: Arc<Table<PendingTotpSetup>>,
    identities: Arc<IdentityStore>,
    sessions: Arc<SessionManager>,
    sealer: SecretBox,
    issuer: String,
    policy: PolicyConfig,
}

impl TotpManager {
    pub fn new(
        store: RecordStore,
        identities: Arc<IdentityStore>,
        sessions: Arc<SessionManager>,
        sealer: SecretBox,
        issuer: String,
        policy: PolicyConfig,
    ) -> IdpResult<Self> {
        let pending = Arc::new(Table::new(store, PENDING_TOTP));
        sessions.subscribe(Arc::new(PendingSetupJanitor {
            pending: pending.clone(),
        }))?;

        Ok(Self {
            pending,
            identities,
            sessions,
            sealer,
            issuer,
            policy,
        })
    }

    pub async fn pending_for(&self, session_id: &str) -> IdpResult<Option<PendingTotpSetup>> {
        self.pending.get(session_id).await
    }

    pub async fn start_setup(
        &self,
        session: &Session,
        username: &str,
        password: &str,
    ) -> IdpResult<TotpSetup> {
        let identity = self.checked_password_identity(&session.account_id, password).await?;
        if identity.totp_enabled() {
            return Err(IdpError::Conflict("TOTP is already enabled".to_string()));
        }

        let secret = totp::generate_secret();
        let now = clock::now_ms();
        let pending = PendingTotpSetup {
            account_id: session.account_id.clone(),
            identity_id: identity.id.clone(),
            secret_base32: totp::encode_secret(&secret),
            secret_hex: hex::encode(&secret),
            otpauth_url: totp::provisioning_url(&secret, &self.issuer, username)?,
            backup_codes: totp::generate_backup_codes(),
            created_at: now,
            expires_at: now + clock::duration_ms(self.policy.pending_totp_ttl),
        };

        self.pending.set(&session.id, &pending).await?;
        let extended = self
            .sessions
            .extend_to_at_least(&session.id, pending.expires_at)
            .await?;

        info!(session_id = %session.id, account_id = %session.account_id, "TOTP setup started");
        Ok(TotpSetup {
            secret: pending.secret_base32,
            otpauth_url: pending.otpauth_url,
            backup_codes: pending.backup_codes,
            expires_at: pending.expires_at,
            session_token: extended.token,
        })
    }

    /// Commit the pending setup; returns a session token for the extended session
    pub async fn finalize_setup(
        &self,
        session: &Session,
        password: &str,
        code: &str,
    ) -> IdpResult<String> {
        let pending = self
            .pending
            .get(&session.id)
            .await?
            .filter(|pending| pending.account_id == session.account_id)
            .ok_or_else(|| IdpError::Validation("No pending TOTP setup".to_string()))?;

        let now = clock::now_ms();
        if pending.expires_at <= now {
            self.pending.delete(&session.id).await?;
            return Err(IdpError::Expired(
                "TOTP setup expired, restart setup".to_string(),
            ));
        }

        let mut identity = self.checked_password_identity(&session.account_id, password).await?;
        if identity.totp_enabled() {
            self.pending.delete(&session.id).await?;
            return Err(IdpError::Conflict("TOTP is already enabled".to_string()));
        }

        let secret = hex::decode(&pending.secret_hex)
            .map_err(|e| IdpError::Internal(format!("Corrupt pending secret: {}", e)))?;
        let code = code.trim();
        let used_backup = if totp::verify_code(&secret, code, totp::unix_now())? {
            None
        } else if pending.backup_codes.iter().any(|c| c == code) {
            Some(code)
        } else {
            return Err(IdpError::Authentication("Invalid TOTP code".to_string()));
        };

        let backup_code_hashes = pending
            .backup_codes
            .iter()
            .filter(|c| Some(c.as_str()) != used_backup)
            .map(|c| hash_password(c))
            .collect::<IdpResult<Vec<_>>>()?;

        let enrollment = TotpEnrollment {
            secret: self.sealer.seal(&secret, &identity.id)?,
            backup_code_hashes,
        };
        set_enrollment(&mut identity, Some(enrollment));
        self.identities.set_by_id(&identity).await?;
        self.pending.delete(&session.id).await?;

        let extended = self
            .sessions
            .extend_to_at_least(
                &session.id,
                now + clock::duration_ms(self.policy.post_totp_session_ttl),
            )
            .await?;

        info!(identity_id = %identity.id, "TOTP enabled");
        Ok(extended.token)
    }

    /// Disable the second factor; needs the password and a current code
    pub async fn remove(&self, session: &Session, password: &str, code: &str) -> IdpResult<()> {
        let mut identity = self.checked_password_identity(&session.account_id, password).await?;
        let enrollment = identity
            .data
            .totp()
            .ok_or_else(|| IdpError::Validation("TOTP not enabled".to_string()))?;

        let secret = self.sealer.open(&enrollment.secret, &identity.id)?;
        if !totp::verify_code(&secret, code, totp::unix_now())? {
            return Err(IdpError::Authentication("Invalid TOTP code".to_string()));
        }

        set_enrollment(&mut identity, None);
        self.identities.set_by_id(&identity).await?;

        info!(identity_id = %identity.id, "TOTP removed");
        Ok(())
    }

    /// Check a login code: a current TOTP or an unused backup code, which is
    /// consumed
    pub async fn verify_second_factor(&self, identity: &mut Identity, code: &str) -> IdpResult<()> {
        let enrollment = identity
            .data
            .totp()
            .cloned()
            .ok_or_else(|| IdpError::Validation("TOTP not enabled".to_string()))?;

        let code = code.trim();
        let secret = self.sealer.open(&enrollment.secret, &identity.id)?;
        if totp::verify_code(&secret, code, totp::unix_now())? {
            return Ok(());
        }

        if totp::looks_like_backup_code(code) {
            for (index, hash) in enrollment.backup_code_hashes.iter().enumerate() {
                if verify_password(code, hash)? {
                    let mut remaining = enrollment.clone();
                    remaining.backup_code_hashes.remove(index);
                    set_enrollment(identity, Some(remaining));
                    self.identities.set_by_id(identity).await?;
                    debug!(identity_id = %identity.id, "Backup code consumed");
                    return Ok(());
                }
            }
        }

        Err(IdpError::Authentication("Invalid TOTP code".to_string()))
    }

    async fn checked_password_identity(&self, account_id: &str, password: &str) -> IdpResult<Identity> {
        let identity = self
            .identities
            .password_identity(account_id)
            .await?
            .ok_or_else(|| IdpError::Validation("Account has no password".to_string()))?;

        let IdentityData::Password { password_hash, .. } = &identity.data else {
            return Err(IdpError::Internal("Password lookup returned another provider".to_string()));
        };
        if !verify_password(password, password_hash)? {
            return Err(IdpError::Authentication("Invalid password".to_string()));
        }

        Ok(identity)
    }
}

fn set_enrollment(identity: &mut Identity, enrollment: Option<TotpEnrollment>) {
    if let IdentityData::Password { totp, .. } = &mut identity.data {
        *totp = enrollment;
    }
}

/// Drops pending setup state together with its session
struct PendingSetupJanitor {
    pending: Arc<Table<PendingTotpSetup>>,
}

#[async_trait]
impl ChangeSubscriber<Session> for PendingSetupJanitor {
    async fn on_change(&self, key: &str, change: Change<'_, Session>) -> IdpResult<()> {
        if let Change::Deleted(_) = change {
            if self.pending.delete(key).await? {
                debug!(session_id = %key, "Pending TOTP setup dropped with its session");
            }
        }
        Ok(())
    }
}
