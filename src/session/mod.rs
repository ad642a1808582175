/// Sessions and sliding renewal
///
/// A session is created on login and carried by the client as a signed
/// bearer token. Every session has exactly one scheduled cleanup event; when
/// renewal or an extension moves the expiry, the old event is cancelled and a
/// new one takes over.

use crate::{
    account::{Account, ACCOUNTS},
    clock,
    config::PolicyConfig,
    crypto::{random_hex, tokens::TokenSigner},
    error::{IdpError, IdpResult},
    metrics,
    scheduler::{EventHandler, EventPayload, EventScheduler, ScheduledEvent},
    store::{Change, ChangeSubscriber, PairIndex, RecordStore, Table},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sessions by id
pub const SESSIONS: &str = "sessions";
/// `(identity_id, session_id)` pairs
pub const SESSION_IDENTITY_INDEX: &str = "session_identity_index";

const SESSION_ID_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub account_id: String,
    pub identity_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub refreshed_at: Option<i64>,
    /// Cleanup event currently responsible for this session
    #[serde(default)]
    pub expiry_event_id: Option<String>,
}

impl Session {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// A freshly created session and its bearer token
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub token: String,
}

/// Outcome of verifying a bearer token
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    pub session: Session,
    pub account: Account,
    /// Set when the session was renewed; the client should switch to it
    pub renewed_token: Option<String>,
}

pub struct SessionManager {
    sessions: Table<Session>,
    identity_index: PairIndex,
    accounts: Table<Account>,
    scheduler: Arc<EventScheduler>,
    signer: Arc<TokenSigner>,
    policy: PolicyConfig,
}

impl SessionManager {
    pub fn new(
        store: RecordStore,
        scheduler: Arc<EventScheduler>,
        signer: Arc<TokenSigner>,
        policy: PolicyConfig,
    ) -> IdpResult<Self> {
        let sessions = Table::new(store.clone(), SESSIONS);
        let identity_index = PairIndex::new(store.clone(), SESSION_IDENTITY_INDEX);
        sessions.subscribe(Arc::new(SessionIdentityIndexer {
            index: identity_index.clone(),
        }))?;

        Ok(Self {
            sessions,
            identity_index,
            accounts: Table::new(store, ACCOUNTS),
            scheduler,
            signer,
            policy,
        })
    }

    /// Observe session writes and deletions
    pub fn subscribe(&self, subscriber: Arc<dyn ChangeSubscriber<Session>>) -> IdpResult<()> {
        self.sessions.subscribe(subscriber)
    }

    pub async fn get(&self, session_id: &str) -> IdpResult<Option<Session>> {
        self.sessions.get(session_id).await
    }

    /// Persist a new session, schedule its cleanup and sign its token
    pub async fn generate(&self, account_id: &str, identity_id: &str) -> IdpResult<IssuedSession> {
        let now = clock::now_ms();
        let session = Session {
            id: random_hex(SESSION_ID_BYTES),
            account_id: account_id.to_string(),
            identity_id: identity_id.to_string(),
            created_at: now,
            expires_at: now + clock::duration_ms(self.policy.session_ttl),
            refreshed_at: None,
            expiry_event_id: None,
        };

        let session = self.move_expiry(session, None).await?;
        let token = self
            .signer
            .sign_session(account_id, &session.id, session.expires_at)?;

        metrics::record_session("created");
        info!(session_id = %session.id, account_id = %account_id, "Session created");

        Ok(IssuedSession { session, token })
    }

    /// Resolve a bearer token to its live session, renewing it near expiry
    pub async fn verify(&self, token: &str) -> IdpResult<VerifiedSession> {
        let claims = self.signer.verify_session(token).map_err(|e| {
            debug!("Rejected session token: {}", e);
            IdpError::Authentication("Session token expired".to_string())
        })?;

        let account = self
            .accounts
            .get(&claims.sub)
            .await?
            .ok_or_else(|| IdpError::Authentication("Account not found".to_string()))?;

        let session = self
            .sessions
            .get(&claims.jti)
            .await?
            .filter(|session| session.account_id == account.id)
            .ok_or_else(|| IdpError::Authentication("Session not found".to_string()))?;

        let now = clock::now_ms();
        if session.is_expired_at(now) {
            self.remove(&session, true).await?;
            return Err(IdpError::Authentication("Session token expired".to_string()));
        }

        let window = clock::duration_ms(self.policy.session_renewal_window);
        if session.expires_at - now >= window {
            return Ok(VerifiedSession {
                session,
                account,
                renewed_token: None,
            });
        }

        let mut renewed = session;
        renewed.refreshed_at = Some(now);
        let new_expiry = now + clock::duration_ms(self.policy.session_ttl);
        let renewed = self.move_expiry(renewed, Some(new_expiry)).await?;
        let token = self
            .signer
            .sign_session(&account.id, &renewed.id, renewed.expires_at)?;

        metrics::record_session("renewed");
        debug!(session_id = %renewed.id, expires_at = renewed.expires_at, "Session renewed");

        Ok(VerifiedSession {
            session: renewed,
            account,
            renewed_token: Some(token),
        })
    }

    /// Push the expiry out to `at` unless it already lies beyond it
    ///
    /// Returns a token signed for the resulting expiry; tokens signed before
    /// the extension still stop at their own `exp`.
    pub async fn extend_to_at_least(&self, session_id: &str, at: i64) -> IdpResult<IssuedSession> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| IdpError::NotFound("Session not found".to_string()))?;

        let session = if session.expires_at >= at {
            session
        } else {
            debug!(session_id = %session_id, from = session.expires_at, to = at, "Extending session");
            self.move_expiry(session, Some(at)).await?
        };

        let token = self
            .signer
            .sign_session(&session.account_id, &session.id, session.expires_at)?;
        Ok(IssuedSession { session, token })
    }

    /// Delete a session and its cleanup event
    pub async fn logout(&self, session_id: &str) -> IdpResult<bool> {
        match self.sessions.get(session_id).await? {
            Some(session) => self.remove(&session, true).await,
            None => Ok(false),
        }
    }

    /// Delete every session opened through `identity_id`
    pub async fn delete_for_identity(&self, identity_id: &str) -> IdpResult<usize> {
        let mut removed = 0;
        for session_id in self.identity_index.seconds_for(identity_id).await? {
            match self.sessions.get(&session_id).await? {
                Some(session) => {
                    if self.remove(&session, true).await? {
                        removed += 1;
                    }
                }
                // Dangling index entry
                None => {
                    self.identity_index.remove(identity_id, &session_id).await?;
                }
            }
        }
        Ok(removed)
    }

    pub async fn list_for_identity(&self, identity_id: &str) -> IdpResult<Vec<Session>> {
        let mut sessions = Vec::new();
        for session_id in self.identity_index.seconds_for(identity_id).await? {
            if let Some(session) = self.sessions.get(&session_id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Cleanup event delivery: delete only if the session really is past expiry
    pub async fn expire_if_due(&self, session_id: &str) -> IdpResult<bool> {
        let Some(session) = self.sessions.get(session_id).await? else {
            return Ok(false);
        };

        if !session.is_expired_at(clock::now_ms()) {
            debug!(session_id = %session_id, "Session was extended, keeping it");
            return Ok(false);
        }

        // The delivering event is removed by the scheduler itself
        self.remove(&session, false).await
    }

    /// Set a new expiry (or keep the current one when `None`), schedule the
    /// replacement cleanup event, save, then retire the previous event
    async fn move_expiry(&self, mut session: Session, expires_at: Option<i64>) -> IdpResult<Session> {
        if let Some(expires_at) = expires_at {
            session.expires_at = expires_at;
        }

        let previous_event = session.expiry_event_id.take();
        let event_id = self
            .scheduler
            .schedule(
                EventPayload::DeleteSession {
                    session_id: session.id.clone(),
                },
                session.expires_at,
            )
            .await?;
        session.expiry_event_id = Some(event_id);

        self.sessions.set(&session.id, &session).await?;

        if let Some(previous) = previous_event {
            self.scheduler.cancel(&previous).await?;
        }

        Ok(session)
    }

    async fn remove(&self, session: &Session, cancel_event: bool) -> IdpResult<bool> {
        let removed = self.sessions.delete(&session.id).await?;

        if cancel_event {
            if let Some(event_id) = &session.expiry_event_id {
                self.scheduler.cancel(event_id).await?;
            }
        }

        if removed {
            metrics::record_session("deleted");
            debug!(session_id = %session.id, "Session deleted");
        }
        Ok(removed)
    }
}

/// Keeps the identity -> sessions index in step with the sessions table
struct SessionIdentityIndexer {
    index: PairIndex,
}

#[async_trait]
impl ChangeSubscriber<Session> for SessionIdentityIndexer {
    async fn on_change(&self, _key: &str, change: Change<'_, Session>) -> IdpResult<()> {
        match change {
            Change::Upserted(session) => self.index.insert(&session.identity_id, &session.id).await,
            Change::Deleted(session) => {
                self.index.remove(&session.identity_id, &session.id).await?;
                Ok(())
            }
        }
    }
}

/// Handles `delete_session` events
pub struct SessionExpiryHandler {
    sessions: Arc<SessionManager>,
}

impl SessionExpiryHandler {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl EventHandler for SessionExpiryHandler {
    async fn handle(&self, event: &ScheduledEvent) -> IdpResult<()> {
        let EventPayload::DeleteSession { session_id } = &event.payload else {
            warn!(event_id = %event.id, "Session handler received a foreign event");
            return Ok(());
        };

        if self.sessions.expire_if_due(session_id).await? {
            info!(session_id = %session_id, "Expired session removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::EventKind;
    use crate::test_support::TestContext;
    use std::time::Duration;

    async fn seed_account(ctx: &TestContext, id: &str) {
        let accounts: Table<Account> = Table::new(ctx.store.clone(), ACCOUNTS);
        accounts
            .set(
                id,
                &Account {
                    id: id.to_string(),
                    username: format!("user-{}", id),
                    display_name: None,
                    avatar_hash: "default".to_string(),
                    pronouns: None,
                    bio: None,
                    authorized_apps: Default::default(),
                    created_at: 0,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_generate_and_verify() {
        let ctx = TestContext::new().await;
        seed_account(&ctx, "acct").await;

        let issued = ctx.sessions.generate("acct", "ident").await.unwrap();
        assert_eq!(issued.session.id.len(), 32);

        let verified = ctx.sessions.verify(&issued.token).await.unwrap();
        assert_eq!(verified.session.id, issued.session.id);
        assert_eq!(verified.account.id, "acct");
        // Fresh sessions are far outside the renewal window
        assert!(verified.renewed_token.is_none());

        let events = ctx.scheduler.list_by_kind(EventKind::DeleteSession).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(Some(events[0].id.clone()), issued.session.expiry_event_id);
    }

    #[tokio::test]
    async fn test_logout_invalidates_token() {
        let ctx = TestContext::new().await;
        seed_account(&ctx, "acct").await;

        let issued = ctx.sessions.generate("acct", "ident").await.unwrap();
        assert!(ctx.sessions.logout(&issued.session.id).await.unwrap());

        match ctx.sessions.verify(&issued.token).await.unwrap_err() {
            IdpError::Authentication(msg) => assert_eq!(msg, "Session not found"),
            e => panic!("Expected authentication error, got {:?}", e),
        }
        assert!(ctx
            .scheduler
            .list_by_kind(EventKind::DeleteSession)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_renewal_inside_window() {
        let mut policy = PolicyConfig::default();
        policy.session_ttl = Duration::from_secs(60 * 60);
        policy.session_renewal_window = Duration::from_secs(2 * 60 * 60);
        let ctx = TestContext::with_policy(policy).await;
        seed_account(&ctx, "acct").await;

        let issued = ctx.sessions.generate("acct", "ident").await.unwrap();
        let old_event = issued.session.expiry_event_id.clone().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let verified = ctx.sessions.verify(&issued.token).await.unwrap();
        let renewed = verified.renewed_token.expect("session should renew");
        assert!(verified.session.refreshed_at.is_some());
        assert!(verified.session.expires_at > issued.session.expires_at);

        // The renewal replaced the cleanup event
        assert!(ctx.scheduler.get(&old_event).await.unwrap().is_none());
        let events = ctx.scheduler.list_by_kind(EventKind::DeleteSession).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(Some(events[0].id.clone()), verified.session.expiry_event_id);

        assert!(ctx.sessions.verify(&renewed).await.is_ok());
    }

    #[tokio::test]
    async fn test_no_renewal_outside_window() {
        let mut policy = PolicyConfig::default();
        policy.session_ttl = Duration::from_secs(60 * 60);
        policy.session_renewal_window = Duration::from_secs(60);
        let ctx = TestContext::with_policy(policy).await;
        seed_account(&ctx, "acct").await;

        let issued = ctx.sessions.generate("acct", "ident").await.unwrap();
        let verified = ctx.sessions.verify(&issued.token).await.unwrap();
        assert!(verified.renewed_token.is_none());
        assert_eq!(verified.session.expires_at, issued.session.expires_at);
    }

    #[tokio::test]
    async fn test_expired_session_is_deleted_on_verify() {
        let ctx = TestContext::new().await;
        seed_account(&ctx, "acct").await;

        let issued = ctx.sessions.generate("acct", "ident").await.unwrap();
        // Stored expiry in the past while the token's own `exp` is still valid
        let mut session = issued.session.clone();
        session.expires_at = clock::now_ms() - 1;
        let sessions: Table<Session> = Table::new(ctx.store.clone(), SESSIONS);
        sessions.set(&session.id, &session).await.unwrap();

        match ctx.sessions.verify(&issued.token).await.unwrap_err() {
            IdpError::Authentication(msg) => assert_eq!(msg, "Session token expired"),
            e => panic!("Expected authentication error, got {:?}", e),
        }
        assert!(ctx.sessions.get(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_token_for_other_account_rejected() {
        let ctx = TestContext::new().await;
        seed_account(&ctx, "acct").await;
        seed_account(&ctx, "other").await;

        let issued = ctx.sessions.generate("acct", "ident").await.unwrap();
        let forged = ctx
            .signer
            .sign_session("other", &issued.session.id, issued.session.expires_at)
            .unwrap();

        match ctx.sessions.verify(&forged).await.unwrap_err() {
            IdpError::Authentication(msg) => assert_eq!(msg, "Session not found"),
            e => panic!("Expected authentication error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_extend_to_at_least_only_moves_forward() {
        let ctx = TestContext::new().await;
        seed_account(&ctx, "acct").await;

        let issued = ctx.sessions.generate("acct", "ident").await.unwrap();
        let earlier = issued.session.expires_at - 1000;
        let same = ctx
            .sessions
            .extend_to_at_least(&issued.session.id, earlier)
            .await
            .unwrap();
        assert_eq!(same.session.expires_at, issued.session.expires_at);
        assert_eq!(same.session.expiry_event_id, issued.session.expiry_event_id);

        let later = issued.session.expires_at + 1000;
        let moved = ctx
            .sessions
            .extend_to_at_least(&issued.session.id, later)
            .await
            .unwrap();
        assert_eq!(moved.session.expires_at, later);
        assert_ne!(moved.session.expiry_event_id, issued.session.expiry_event_id);
    }

    #[tokio::test]
    async fn test_extension_reissues_token_for_new_expiry() {
        let ctx = TestContext::new().await;
        seed_account(&ctx, "acct").await;

        let issued = ctx.sessions.generate("acct", "ident").await.unwrap();
        let later = issued.session.expires_at + 60_000;
        let extended = ctx
            .sessions
            .extend_to_at_least(&issued.session.id, later)
            .await
            .unwrap();

        let claims = ctx.signer.verify_session(&extended.token).unwrap();
        assert_eq!(claims.jti, issued.session.id);
        assert_eq!(claims.exp, later / 1000);
        assert_ne!(extended.token, issued.token);

        let verified = ctx.sessions.verify(&extended.token).await.unwrap();
        assert_eq!(verified.session.expires_at, later);
    }

    #[tokio::test]
    async fn test_delete_for_identity_uses_index() {
        let ctx = TestContext::new().await;
        seed_account(&ctx, "acct").await;

        ctx.sessions.generate("acct", "ident-a").await.unwrap();
        ctx.sessions.generate("acct", "ident-a").await.unwrap();
        let keep = ctx.sessions.generate("acct", "ident-b").await.unwrap();

        assert_eq!(ctx.sessions.list_for_identity("ident-a").await.unwrap().len(), 2);
        assert_eq!(ctx.sessions.delete_for_identity("ident-a").await.unwrap(), 2);
        assert!(ctx.sessions.list_for_identity("ident-a").await.unwrap().is_empty());
        assert!(ctx.sessions.verify(&keep.token).await.is_ok());
    }

    #[tokio::test]
    async fn test_expiry_event_removes_session() {
        let mut policy = PolicyConfig::default();
        policy.session_ttl = Duration::from_millis(50);
        policy.session_renewal_window = Duration::from_millis(10);
        let ctx = TestContext::with_policy(policy).await;
        ctx.scheduler.start().await.unwrap();
        seed_account(&ctx, "acct").await;

        let issued = ctx.sessions.generate("acct", "ident").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(ctx.sessions.get(&issued.session.id).await.unwrap().is_none());
        assert!(ctx.sessions.list_for_identity("ident").await.unwrap().is_empty());
    }
}
