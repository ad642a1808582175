/// Identity persistence and its two indexes
use super::{
    provider_key, Identity, IdentityData, Provider, ACCOUNT_IDENTITY_INDEX, IDENTITIES,
    PROVIDER_INDEX,
};
use crate::{
    clock,
    config::PolicyConfig,
    crypto::generate_id,
    error::{IdpError, IdpResult},
    scheduler::{EventPayload, EventScheduler},
    session::SessionManager,
    store::{Lookup, PairIndex, RecordStore, Table},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct IdentityStore {
    identities: Table<Identity>,
    provider_index: Lookup,
    account_index: PairIndex,
    sessions: Arc<SessionManager>,
    scheduler: Arc<EventScheduler>,
    policy: PolicyConfig,
}

impl IdentityStore {
    pub fn new(
        store: RecordStore,
        sessions: Arc<SessionManager>,
        scheduler: Arc<EventScheduler>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            identities: Table::new(store.clone(), IDENTITIES),
            provider_index: Table::new(store.clone(), PROVIDER_INDEX),
            account_index: PairIndex::new(store, ACCOUNT_IDENTITY_INDEX),
            sessions,
            scheduler,
            policy,
        }
    }

    pub async fn get_by_id(&self, identity_id: &str) -> IdpResult<Option<Identity>> {
        self.identities.get(identity_id).await
    }

    pub async fn get_by_provider(
        &self,
        provider: Provider,
        provider_id: &str,
    ) -> IdpResult<Option<Identity>> {
        let key = provider_key(provider, provider_id);
        let Some(identity_id) = self.provider_index.get(&key).await? else {
            return Ok(None);
        };

        match self.identities.get(&identity_id).await? {
            Some(identity) if identity.provider() == provider && identity.provider_id == provider_id => {
                Ok(Some(identity))
            }
            Some(identity) => {
                warn!(
                    lookup = %key,
                    identity_id = %identity.id,
                    "Provider index points at a {} identity",
                    identity.provider()
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// The password identity of an account, if it has one
    pub async fn password_identity(&self, account_id: &str) -> IdpResult<Option<Identity>> {
        self.get_by_provider(Provider::Password, account_id).await
    }

    /// Link a new identity; the (provider, provider id) pair must be free
    pub async fn link(
        &self,
        account_id: &str,
        provider_id: &str,
        data: IdentityData,
    ) -> IdpResult<Identity> {
        let identity = Identity {
            id: generate_id(),
            account_id: account_id.to_string(),
            provider_id: provider_id.to_string(),
            created_at: clock::now_ms(),
            last_used_at: None,
            last_refreshed_at: None,
            data,
        };

        let key = identity.lookup_key();
        if !self.provider_index.insert_new(&key, &identity.id).await? {
            return Err(IdpError::Conflict(format!(
                "{} identity is already linked",
                identity.provider()
            )));
        }

        self.identities.set(&identity.id, &identity).await?;
        self.account_index.insert(account_id, &identity.id).await?;

        if identity.provider().is_refreshable() {
            let fire_at = clock::from_now(self.policy.identity_refresh_interval);
            self.scheduler
                .schedule(
                    EventPayload::RefreshIdentity {
                        identity_id: identity.id.clone(),
                    },
                    fire_at,
                )
                .await?;
        }

        info!(identity_id = %identity.id, account_id = %account_id, provider = %identity.provider(), "Identity linked");
        Ok(identity)
    }

    /// Write an identity and bring both indexes in line with it
    pub async fn set_by_id(&self, identity: &Identity) -> IdpResult<()> {
        let key = identity.lookup_key();
        if let Some(owner) = self.provider_index.get(&key).await? {
            if owner != identity.id {
                return Err(IdpError::Conflict(format!(
                    "{} identity is already linked",
                    identity.provider()
                )));
            }
        }

        let previous = self.identities.get(&identity.id).await?;
        self.identities.set(&identity.id, identity).await?;
        self.provider_index.set(&key, &identity.id).await?;
        self.account_index
            .insert(&identity.account_id, &identity.id)
            .await?;

        if let Some(previous) = previous {
            let previous_key = previous.lookup_key();
            if previous_key != key {
                self.release_lookup(&previous_key, &identity.id).await?;
            }
            if previous.account_id != identity.account_id {
                self.account_index
                    .remove(&previous.account_id, &identity.id)
                    .await?;
            }
        }

        Ok(())
    }

    /// Delete an identity, its sessions and both index entries
    pub async fn delete_by_id(&self, identity_id: &str) -> IdpResult<bool> {
        let Some(identity) = self.identities.get(identity_id).await? else {
            return Ok(false);
        };

        let sessions = self.sessions.delete_for_identity(identity_id).await?;
        self.identities.delete(identity_id).await?;
        self.release_lookup(&identity.lookup_key(), identity_id).await?;
        self.account_index
            .remove(&identity.account_id, identity_id)
            .await?;

        info!(identity_id = %identity_id, sessions, "Identity deleted");
        Ok(true)
    }

    pub async fn delete_by_provider(&self, provider: Provider, provider_id: &str) -> IdpResult<bool> {
        match self.get_by_provider(provider, provider_id).await? {
            Some(identity) => self.delete_by_id(&identity.id).await,
            None => Ok(false),
        }
    }

    pub async fn list_for_account(&self, account_id: &str) -> IdpResult<Vec<Identity>> {
        let mut identities = Vec::new();
        for identity_id in self.account_index.seconds_for(account_id).await? {
            match self.identities.get(&identity_id).await? {
                Some(identity) => identities.push(identity),
                None => debug!(identity_id = %identity_id, "Skipping dangling account index entry"),
            }
        }
        identities.sort_by_key(|identity| identity.created_at);
        Ok(identities)
    }

    /// User-initiated removal; an account always keeps one identity
    pub async fn delete_for_account(&self, account_id: &str, identity_id: &str) -> IdpResult<()> {
        let identities = self.list_for_account(account_id).await?;
        if !identities.iter().any(|identity| identity.id == identity_id) {
            return Err(IdpError::NotFound("Identity not found".to_string()));
        }
        if identities.len() <= 1 {
            return Err(IdpError::Validation(
                "Cannot delete the only identity on an account".to_string(),
            ));
        }

        self.delete_by_id(identity_id).await?;
        Ok(())
    }

    /// Record a successful login through this identity
    pub async fn touch(&self, identity: &mut Identity) -> IdpResult<()> {
        identity.last_used_at = Some(clock::now_ms());
        self.identities.set(&identity.id, identity).await
    }

    async fn release_lookup(&self, key: &str, identity_id: &str) -> IdpResult<()> {
        if self.provider_index.get(key).await?.as_deref() == Some(identity_id) {
            self.provider_index.delete(key).await?;
        }
        Ok(())
    }
}
