/// OAuth client applications
use super::scope::ScopeSet;
use crate::{
    clock,
    crypto::{
        generate_id,
        password::{hash_password, verify_password},
        random_hex,
    },
    error::{IdpError, IdpResult},
    store::{Lookup, RecordStore, Table},
};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

/// Applications by client id
pub const APPLICATIONS: &str = "applications";
/// Application name -> client id
pub const APPLICATION_NAME_INDEX: &str = "application_name_index";

const SECRET_BYTES: usize = 32;
const NAME_MAX: usize = 64;
const DESCRIPTION_MAX: usize = 1000;

lazy_static! {
    static ref REDIRECT_URI_RE: Regex = Regex::new(
        r"^https?://(localhost|([a-z0-9-]+\.)+[a-zA-Z]{2,}(:\d{1,5})?|([a-z0-9-]+)(:\d{1,5}))(/[^\n]*)?$"
    )
    .unwrap();
}

/// A live authorization code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCode {
    pub user_id: String,
    pub scope: ScopeSet,
    pub redirect_uri: String,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub expiry_event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    pub secret_hash: String,
    /// Code value -> grant
    #[serde(default)]
    pub auth_codes: BTreeMap<String, AuthCode>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Application {
    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }

    pub fn view(&self) -> ApplicationView {
        ApplicationView {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            redirect_uris: self.redirect_uris.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Application as shown to admins, without the secret hash or live codes
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationView {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub redirect_uris: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Partial update; `None` keeps the current value
#[derive(Debug, Clone, Default)]
pub struct ApplicationUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub redirect_uris: Option<Vec<String>>,
}

pub fn validate_redirect_uri(uri: &str) -> IdpResult<()> {
    if !REDIRECT_URI_RE.is_match(uri) {
        return Err(IdpError::Validation(format!("Invalid redirect URI: {}", uri)));
    }
    Ok(())
}

fn validate_name(name: &str) -> IdpResult<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > NAME_MAX {
        return Err(IdpError::Validation(format!(
            "Application name must be 1-{} characters",
            NAME_MAX
        )));
    }
    Ok(name.to_string())
}

fn validate_description(description: String) -> IdpResult<Option<String>> {
    let description = description.trim();
    if description.chars().count() > DESCRIPTION_MAX {
        return Err(IdpError::Validation(format!(
            "Description must be at most {} characters",
            DESCRIPTION_MAX
        )));
    }
    Ok((!description.is_empty()).then(|| description.to_string()))
}

pub struct ApplicationStore {
    apps: Table<Application>,
    names: Lookup,
    /// Serializes read-modify-write of application records
    writes: Mutex<()>,
}

impl ApplicationStore {
    pub fn new(store: RecordStore) -> Self {
        Self {
            apps: Table::new(store.clone(), APPLICATIONS),
            names: Table::new(store, APPLICATION_NAME_INDEX),
            writes: Mutex::new(()),
        }
    }

    /// Register a client; the plaintext secret is returned only here
    pub async fn create(
        &self,
        name: &str,
        description: Option<String>,
    ) -> IdpResult<(Application, String)> {
        let name = validate_name(name)?;
        let description = match description {
            Some(description) => validate_description(description)?,
            None => None,
        };

        let secret = random_hex(SECRET_BYTES);
        let now = clock::now_ms();
        let app = Application {
            id: generate_id(),
            name: name.clone(),
            description,
            redirect_uris: Vec::new(),
            secret_hash: hash_password(&secret)?,
            auth_codes: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };

        if !self.names.insert_new(&name, &app.id).await? {
            return Err(IdpError::Conflict("Application name already taken".to_string()));
        }
        self.apps.set(&app.id, &app).await?;

        info!(client_id = %app.id, name = %app.name, "Application created");
        Ok((app, secret))
    }

    pub async fn get(&self, client_id: &str) -> IdpResult<Option<Application>> {
        self.apps.get(client_id).await
    }

    pub async fn get_by_name(&self, name: &str) -> IdpResult<Option<Application>> {
        match self.names.get(name.trim()).await? {
            Some(client_id) => self.apps.get(&client_id).await,
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> IdpResult<Vec<Application>> {
        self.apps.all().await
    }

    /// Hold while reading, modifying and saving an application record
    ///
    /// Never call into the scheduler with this held: a delivery pass may
    /// run code expiry, which takes it again.
    pub async fn lock_records(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().await
    }

    pub async fn update(&self, client_id: &str, update: ApplicationUpdate) -> IdpResult<Application> {
        let _guard = self.lock_records().await;
        let mut app = self.require(client_id).await?;

        if let Some(uris) = update.redirect_uris {
            for uri in &uris {
                validate_redirect_uri(uri)?;
            }
            app.redirect_uris = uris;
        }
        if let Some(description) = update.description {
            app.description = validate_description(description)?;
        }

        let mut released = None;
        if let Some(name) = update.name {
            let name = validate_name(&name)?;
            if name != app.name {
                if !self.names.insert_new(&name, &app.id).await? {
                    return Err(IdpError::Conflict("Application name already taken".to_string()));
                }
                released = Some(std::mem::replace(&mut app.name, name));
            }
        }

        app.updated_at = clock::now_ms();
        self.apps.set(&app.id, &app).await?;

        if let Some(previous) = released {
            self.release_name(&previous, &app.id).await?;
        }
        Ok(app)
    }

    /// Replace the client secret; the old one stops working immediately
    pub async fn rotate_secret(&self, client_id: &str) -> IdpResult<String> {
        let _guard = self.lock_records().await;
        let mut app = self.require(client_id).await?;
        let secret = random_hex(SECRET_BYTES);
        app.secret_hash = hash_password(&secret)?;
        app.updated_at = clock::now_ms();
        self.apps.set(&app.id, &app).await?;

        info!(client_id = %client_id, "Application secret rotated");
        Ok(secret)
    }

    /// Remove the application, returning it so callers can retire its codes
    pub async fn delete(&self, client_id: &str) -> IdpResult<Option<Application>> {
        let _guard = self.lock_records().await;
        let Some(app) = self.apps.get(client_id).await? else {
            return Ok(None);
        };
        self.apps.delete(client_id).await?;
        self.release_name(&app.name, client_id).await?;

        info!(client_id = %client_id, "Application deleted");
        Ok(Some(app))
    }

    /// Persist a modified application; callers hold `lock_records`
    pub async fn save(&self, app: &Application) -> IdpResult<()> {
        self.apps.set(&app.id, app).await
    }

    /// Authenticate a client by id and secret
    pub async fn verify_secret(&self, client_id: &str, secret: &str) -> IdpResult<Application> {
        let invalid = || IdpError::Authentication("Invalid client credentials".to_string());

        let app = self.apps.get(client_id).await?.ok_or_else(invalid)?;
        if !verify_password(secret, &app.secret_hash)? {
            return Err(invalid());
        }
        Ok(app)
    }

    async fn require(&self, client_id: &str) -> IdpResult<Application> {
        self.apps
            .get(client_id)
            .await?
            .ok_or_else(|| IdpError::NotFound("Application not found".to_string()))
    }

    async fn release_name(&self, name: &str, client_id: &str) -> IdpResult<()> {
        if self.names.get(name).await?.as_deref() == Some(client_id) {
            self.names.delete(name).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ApplicationStore {
        let pool = crate::db::create_memory_pool().await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        ApplicationStore::new(RecordStore::new(pool))
    }

    #[test]
    fn test_redirect_uri_rules() {
        for ok in [
            "http://localhost",
            "http://localhost/cb",
            "https://example.com/callback?x=1",
            "https://app.example.co:8443/cb",
            "http://devbox:3000/cb",
        ] {
            assert!(validate_redirect_uri(ok).is_ok(), "{}", ok);
        }
        for bad in [
            "ftp://example.com/cb",
            "https://example",
            "javascript:alert(1)",
            "https://evil.com\n/cb",
        ] {
            assert!(validate_redirect_uri(bad).is_err(), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_create_and_verify_secret() {
        let apps = store().await;
        let (app, secret) = apps.create("demo", None).await.unwrap();
        assert_eq!(secret.len(), 64);
        assert_ne!(app.secret_hash, secret);

        assert!(apps.verify_secret(&app.id, &secret).await.is_ok());
        match apps.verify_secret(&app.id, "nope").await.unwrap_err() {
            IdpError::Authentication(msg) => assert_eq!(msg, "Invalid client credentials"),
            e => panic!("Expected authentication error, got {:?}", e),
        }
        assert!(apps.verify_secret("missing", &secret).await.is_err());
    }

    #[tokio::test]
    async fn test_names_are_unique() {
        let apps = store().await;
        apps.create("demo", None).await.unwrap();
        match apps.create("demo", None).await.unwrap_err() {
            IdpError::Conflict(_) => {}
            e => panic!("Expected conflict, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_update_validates_redirects_and_renames() {
        let apps = store().await;
        let (app, _) = apps.create("demo", None).await.unwrap();

        let bad = ApplicationUpdate {
            redirect_uris: Some(vec!["not a uri".to_string()]),
            ..Default::default()
        };
        assert!(apps.update(&app.id, bad).await.is_err());

        let updated = apps
            .update(
                &app.id,
                ApplicationUpdate {
                    name: Some("demo2".to_string()),
                    redirect_uris: Some(vec!["https://example.com/cb".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.allows_redirect("https://example.com/cb"));
        assert!(apps.get_by_name("demo").await.unwrap().is_none());
        assert_eq!(apps.get_by_name("demo2").await.unwrap().map(|a| a.id), Some(app.id));
    }

    #[tokio::test]
    async fn test_rotate_secret_invalidates_old() {
        let apps = store().await;
        let (app, old) = apps.create("demo", None).await.unwrap();
        let new = apps.rotate_secret(&app.id).await.unwrap();

        assert!(apps.verify_secret(&app.id, &old).await.is_err());
        assert!(apps.verify_secret(&app.id, &new).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_frees_name() {
        let apps = store().await;
        let (app, _) = apps.create("demo", None).await.unwrap();
        assert!(apps.delete(&app.id).await.unwrap().is_some());
        assert!(apps.get(&app.id).await.unwrap().is_none());
        apps.create("demo", None).await.unwrap();
    }
}
