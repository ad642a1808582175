/// Account manager: registration, login and the account lifecycle
use super::{
    validate_display_name, validate_password, validate_username, Account, ProfilePatch, ACCOUNTS,
    DEFAULT_AVATAR, USERNAME_INDEX,
};
use crate::{
    clock,
    crypto::{
        generate_id,
        password::{hash_password, verify_password},
    },
    error::{IdpError, IdpResult},
    identity::{Identity, IdentityData, IdentityStore},
    metrics,
    session::{IssuedSession, SessionManager},
    store::{Lookup, RecordStore, Table},
    totp::TotpManager,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INVALID_LOGIN: &str = "Invalid username or password";

/// Result of a password login
#[derive(Debug)]
pub enum LoginOutcome {
    Session {
        account: Account,
        issued: IssuedSession,
    },
    /// Password accepted, a TOTP or backup code is needed to finish
    TotpRequired,
}

/// Account manager service
pub struct AccountManager {
    accounts: Table<Account>,
    usernames: Lookup,
    identities: Arc<IdentityStore>,
    sessions: Arc<SessionManager>,
    totp: Arc<TotpManager>,
}

impl AccountManager {
    pub fn new(
        store: RecordStore,
        identities: Arc<IdentityStore>,
        sessions: Arc<SessionManager>,
        totp: Arc<TotpManager>,
    ) -> Self {
        Self {
            accounts: Table::new(store.clone(), ACCOUNTS),
            usernames: Table::new(store, USERNAME_INDEX),
            identities,
            sessions,
            totp,
        }
    }

    /// Create an account with no identities yet
    pub async fn create(&self, username: &str, display_name: Option<String>) -> IdpResult<Account> {
        validate_username(username)?;
        let display_name = validate_display_name(display_name)?;

        let account = Account {
            id: generate_id(),
            username: username.to_string(),
            display_name,
            avatar_hash: DEFAULT_AVATAR.to_string(),
            pronouns: None,
            bio: None,
            authorized_apps: BTreeSet::new(),
            created_at: clock::now_ms(),
        };

        if !self.usernames.insert_new(username, &account.id).await? {
            return Err(IdpError::Conflict("Username already taken".to_string()));
        }

        if let Err(e) = self.accounts.set(&account.id, &account).await {
            self.usernames.delete(username).await?;
            return Err(e);
        }

        info!(account_id = %account.id, username = %username, "Account created");
        Ok(account)
    }

    /// Create an account with a password identity and open a session
    pub async fn register_with_password(
        &self,
        username: &str,
        display_name: Option<String>,
        password: &str,
    ) -> IdpResult<(Account, IssuedSession)> {
        validate_password(password)?;
        let account = self.create(username, display_name).await?;

        let identity = match self.link_password(&account.id, password).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(account_id = %account.id, "Rolling back registration: {}", e);
                self.delete(&account.id).await?;
                return Err(e);
            }
        };

        let issued = self.sessions.generate(&account.id, &identity.id).await?;
        Ok((account, issued))
    }

    pub async fn get_by_id(&self, account_id: &str) -> IdpResult<Option<Account>> {
        self.accounts.get(account_id).await
    }

    pub async fn get_by_username(&self, username: &str) -> IdpResult<Option<Account>> {
        let Some(account_id) = self.usernames.get(username).await? else {
            return Ok(None);
        };
        Ok(self
            .accounts
            .get(&account_id)
            .await?
            .filter(|account| account.username == username))
    }

    async fn require(&self, account_id: &str) -> IdpResult<Account> {
        self.get_by_id(account_id)
            .await?
            .ok_or_else(|| IdpError::NotFound("Account not found".to_string()))
    }

    pub async fn update_profile(&self, account_id: &str, patch: ProfilePatch) -> IdpResult<Account> {
        let mut account = self.require(account_id).await?;
        patch.apply(&mut account)?;
        self.accounts.set(&account.id, &account).await?;
        Ok(account)
    }

    /// Move an account to a new username, keeping the index consistent
    pub async fn change_username(&self, account_id: &str, username: &str) -> IdpResult<Account> {
        validate_username(username)?;
        let mut account = self.require(account_id).await?;
        if account.username == username {
            return Ok(account);
        }

        if !self.usernames.insert_new(username, &account.id).await? {
            return Err(IdpError::Conflict("Username already taken".to_string()));
        }

        let previous = std::mem::replace(&mut account.username, username.to_string());
        self.accounts.set(&account.id, &account).await?;
        self.release_username(&previous, &account.id).await?;

        info!(account_id = %account.id, from = %previous, to = %username, "Username changed");
        Ok(account)
    }

    pub async fn add_authorized_app(&self, account_id: &str, client_id: &str) -> IdpResult<Account> {
        let mut account = self.require(account_id).await?;
        if account.authorized_apps.insert(client_id.to_string()) {
            self.accounts.set(&account.id, &account).await?;
        }
        Ok(account)
    }

    /// Close an account: identities (and through them sessions), the
    /// username entry, then the record
    pub async fn delete(&self, account_id: &str) -> IdpResult<bool> {
        let Some(account) = self.get_by_id(account_id).await? else {
            return Ok(false);
        };

        for identity in self.identities.list_for_account(account_id).await? {
            self.identities.delete_by_id(&identity.id).await?;
        }
        self.release_username(&account.username, account_id).await?;
        self.accounts.delete(account_id).await?;

        info!(account_id = %account_id, "Account deleted");
        Ok(true)
    }

    pub async fn login_with_password(
        &self,
        username: &str,
        password: &str,
        code: Option<&str>,
    ) -> IdpResult<LoginOutcome> {
        let Some(account) = self.get_by_username(username).await? else {
            return Err(login_failed("unknown_user"));
        };
        let Some(mut identity) = self.identities.password_identity(&account.id).await? else {
            return Err(login_failed("no_password"));
        };
        if !verify_password(password, password_hash(&identity)?)? {
            return Err(login_failed("bad_password"));
        }

        let code = code.map(str::trim).filter(|c| !c.is_empty());
        match (identity.totp_enabled(), code) {
            (false, Some(_)) => {
                return Err(IdpError::Validation("TOTP not enabled".to_string()));
            }
            (true, None) => {
                metrics::record_login("totp_required");
                return Ok(LoginOutcome::TotpRequired);
            }
            (true, Some(code)) => {
                if let Err(e) = self.totp.verify_second_factor(&mut identity, code).await {
                    metrics::record_login("bad_totp");
                    return Err(e);
                }
            }
            (false, None) => {}
        }

        self.identities.touch(&mut identity).await?;
        let issued = self.sessions.generate(&account.id, &identity.id).await?;

        metrics::record_login("success");
        info!(account_id = %account.id, "Password login");
        Ok(LoginOutcome::Session { account, issued })
    }

    pub async fn list_identities(&self, account_id: &str) -> IdpResult<Vec<Identity>> {
        self.identities.list_for_account(account_id).await
    }

    pub async fn delete_identity(&self, account_id: &str, identity_id: &str) -> IdpResult<()> {
        self.identities.delete_for_account(account_id, identity_id).await
    }

    /// Give an account without one a password identity
    pub async fn add_password(&self, account_id: &str, password: &str) -> IdpResult<Identity> {
        validate_password(password)?;
        self.require(account_id).await?;
        if self.identities.password_identity(account_id).await?.is_some() {
            return Err(IdpError::Conflict("Account already has a password".to_string()));
        }
        self.link_password(account_id, password).await
    }

    pub async fn change_password(
        &self,
        account_id: &str,
        current: &str,
        new: &str,
        code: Option<&str>,
    ) -> IdpResult<()> {
        validate_password(new)?;
        let mut identity = self
            .identities
            .password_identity(account_id)
            .await?
            .ok_or_else(|| IdpError::Validation("Account has no password".to_string()))?;

        if !verify_password(current, password_hash(&identity)?)? {
            return Err(IdpError::Authentication("Invalid password".to_string()));
        }

        if identity.totp_enabled() {
            let code = code
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| IdpError::Validation("TOTP code required".to_string()))?;
            self.totp.verify_second_factor(&mut identity, code).await?;
        }

        if let IdentityData::Password { password_hash, .. } = &mut identity.data {
            *password_hash = hash_password(new)?;
        }
        self.identities.set_by_id(&identity).await?;

        info!(account_id = %account_id, "Password changed");
        Ok(())
    }

    async fn link_password(&self, account_id: &str, password: &str) -> IdpResult<Identity> {
        let data = IdentityData::Password {
            password_hash: hash_password(password)?,
            totp: None,
        };
        self.identities.link(account_id, account_id, data).await
    }

    async fn release_username(&self, username: &str, account_id: &str) -> IdpResult<()> {
        if self.usernames.get(username).await?.as_deref() == Some(account_id) {
            self.usernames.delete(username).await?;
        }
        Ok(())
    }
}

fn password_hash(identity: &Identity) -> IdpResult<&str> {
    match &identity.data {
        IdentityData::Password { password_hash, .. } => Ok(password_hash),
        _ => Err(IdpError::Internal("Not a password identity".to_string())),
    }
}

fn login_failed(reason: &str) -> IdpError {
    debug!(reason, "Password login rejected");
    metrics::record_login("failure");
    IdpError::Authentication(INVALID_LOGIN.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::totp;
    use crate::identity::Provider;
    use crate::test_support::TestContext;

    const PASSWORD: &str = "hunter2hunter2";

    #[tokio::test]
    async fn test_create_rejects_duplicate_username() {
        let ctx = TestContext::new().await;
        ctx.accounts.create("alice", None).await.unwrap();

        match ctx.accounts.create("alice", None).await.unwrap_err() {
            IdpError::Conflict(_) => {}
            e => panic!("Expected conflict, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let ctx = TestContext::new().await;
        let (account, issued) = ctx
            .accounts
            .register_with_password("alice", Some("Alice".to_string()), PASSWORD)
            .await
            .unwrap();
        assert!(ctx.sessions.verify(&issued.token).await.is_ok());

        match ctx.accounts.login_with_password("alice", PASSWORD, None).await.unwrap() {
            LoginOutcome::Session { account: logged_in, issued } => {
                assert_eq!(logged_in.id, account.id);
                assert!(ctx.sessions.verify(&issued.token).await.is_ok());
            }
            LoginOutcome::TotpRequired => panic!("TOTP is not enabled"),
        }

        let identity = ctx
            .identities
            .password_identity(&account.id)
            .await
            .unwrap()
            .unwrap();
        assert!(identity.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_login_failures_look_alike() {
        let ctx = TestContext::new().await;
        ctx.accounts
            .register_with_password("alice", None, PASSWORD)
            .await
            .unwrap();

        for (user, pw) in [("alice", "wrong-password"), ("nobody", PASSWORD)] {
            match ctx.accounts.login_with_password(user, pw, None).await.unwrap_err() {
                IdpError::Authentication(msg) => assert_eq!(msg, INVALID_LOGIN),
                e => panic!("Expected authentication error, got {:?}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_code_without_totp_is_distinct_error() {
        let ctx = TestContext::new().await;
        ctx.accounts
            .register_with_password("alice", None, PASSWORD)
            .await
            .unwrap();

        match ctx
            .accounts
            .login_with_password("alice", PASSWORD, Some("123456"))
            .await
            .unwrap_err()
        {
            IdpError::Validation(msg) => assert_eq!(msg, "TOTP not enabled"),
            e => panic!("Expected validation error, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_login_with_totp() {
        let ctx = TestContext::new().await;
        let (_, issued) = ctx
            .accounts
            .register_with_password("alice", None, PASSWORD)
            .await
            .unwrap();
        let setup = ctx
            .totp
            .start_setup(&issued.session, "alice", PASSWORD)
            .await
            .unwrap();
        let secret =
            base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &setup.secret).unwrap();
        let code = totp::code_at(&secret, totp::unix_now()).unwrap();
        ctx.totp
            .finalize_setup(&issued.session, PASSWORD, &code)
            .await
            .unwrap();

        assert!(matches!(
            ctx.accounts.login_with_password("alice", PASSWORD, None).await.unwrap(),
            LoginOutcome::TotpRequired
        ));
        match ctx
            .accounts
            .login_with_password("alice", PASSWORD, Some("99999999"))
            .await
            .unwrap_err()
        {
            IdpError::Authentication(msg) => assert_eq!(msg, "Invalid TOTP code"),
            e => panic!("Expected authentication error, got {:?}", e),
        }
        assert!(matches!(
            ctx.accounts
                .login_with_password("alice", PASSWORD, Some(&code))
                .await
                .unwrap(),
            LoginOutcome::Session { .. }
        ));
    }

    #[tokio::test]
    async fn test_change_username_moves_index() {
        let ctx = TestContext::new().await;
        let alice = ctx.accounts.create("alice", None).await.unwrap();
        ctx.accounts.create("bob", None).await.unwrap();

        match ctx.accounts.change_username(&alice.id, "bob").await.unwrap_err() {
            IdpError::Conflict(_) => {}
            e => panic!("Expected conflict, got {:?}", e),
        }

        ctx.accounts.change_username(&alice.id, "alicia").await.unwrap();
        assert!(ctx.accounts.get_by_username("alice").await.unwrap().is_none());
        assert_eq!(
            ctx.accounts.get_by_username("alicia").await.unwrap().map(|a| a.id),
            Some(alice.id.clone())
        );

        // The freed name can be taken again
        ctx.accounts.create("alice", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let ctx = TestContext::new().await;
        let (account, issued) = ctx
            .accounts
            .register_with_password("alice", None, PASSWORD)
            .await
            .unwrap();

        assert!(ctx.accounts.delete(&account.id).await.unwrap());
        assert!(ctx.accounts.get_by_username("alice").await.unwrap().is_none());
        assert!(ctx.identities.list_for_account(&account.id).await.unwrap().is_empty());
        assert!(ctx
            .identities
            .get_by_provider(Provider::Password, &account.id)
            .await
            .unwrap()
            .is_none());
        assert!(ctx.sessions.get(&issued.session.id).await.unwrap().is_none());
        assert!(ctx.sessions.verify(&issued.token).await.is_err());
    }

    #[tokio::test]
    async fn test_add_and_change_password() {
        let ctx = TestContext::new().await;
        let account = ctx.accounts.create("carol", None).await.unwrap();

        ctx.accounts.add_password(&account.id, PASSWORD).await.unwrap();
        match ctx.accounts.add_password(&account.id, PASSWORD).await.unwrap_err() {
            IdpError::Conflict(_) => {}
            e => panic!("Expected conflict, got {:?}", e),
        }

        match ctx
            .accounts
            .change_password(&account.id, "not-the-password", "new-password-1", None)
            .await
            .unwrap_err()
        {
            IdpError::Authentication(_) => {}
            e => panic!("Expected authentication error, got {:?}", e),
        }

        ctx.accounts
            .change_password(&account.id, PASSWORD, "new-password-1", None)
            .await
            .unwrap();
        assert!(ctx
            .accounts
            .login_with_password("carol", "new-password-1", None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_update_profile_and_authorized_apps() {
        let ctx = TestContext::new().await;
        let account = ctx.accounts.create("dave", None).await.unwrap();

        let updated = ctx
            .accounts
            .update_profile(
                &account.id,
                ProfilePatch {
                    display_name: Some("Dave".to_string()),
                    bio: Some("hello".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.display_name.as_deref(), Some("Dave"));

        let updated = ctx.accounts.add_authorized_app(&account.id, "client-1").await.unwrap();
        assert!(updated.has_authorized("client-1"));
        // Profile edits survived the second write
        assert_eq!(updated.bio.as_deref(), Some("hello"));
    }
}
