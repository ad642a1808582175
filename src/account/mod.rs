/// Account management
///
/// Accounts own identities (password or federated) and sessions. This
/// module holds the account record and its input validation; the manager
/// drives registration, login and the cascades on deletion.

pub mod manager;

pub use manager::{AccountManager, LoginOutcome};

use crate::error::{IdpError, IdpResult};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Accounts by id
pub const ACCOUNTS: &str = "accounts";
/// Username -> account id
pub const USERNAME_INDEX: &str = "username_index";

pub const DEFAULT_AVATAR: &str = "default";

const PASSWORD_MIN: usize = 8;
const PASSWORD_MAX: usize = 128;
const DISPLAY_NAME_MIN: usize = 2;
const DISPLAY_NAME_MAX: usize = 100;
const PRONOUNS_MAX: usize = 100;
const BIO_MAX: usize = 10200;

lazy_static! {
    static ref USERNAME_RE: Regex = Regex::new(r"^[a-zA-Z0-9_.-]{3,32}$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub avatar_hash: String,
    #[serde(default)]
    pub pronouns: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    /// Client ids the user has granted access to
    #[serde(default)]
    pub authorized_apps: BTreeSet<String>,
    pub created_at: i64,
}

impl Account {
    pub fn has_authorized(&self, client_id: &str) -> bool {
        self.authorized_apps.contains(client_id)
    }
}

/// Profile edit. `None` leaves a field alone, an empty string clears it.
///
/// Usernames are changed through [`AccountManager::change_username`] so the
/// index can never drift from the record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilePatch {
    pub display_name: Option<String>,
    pub avatar_hash: Option<String>,
    pub pronouns: Option<String>,
    pub bio: Option<String>,
}

impl ProfilePatch {
    /// Apply to `account` after validating every field
    pub fn apply(self, account: &mut Account) -> IdpResult<()> {
        if let Some(name) = self.display_name {
            account.display_name = clearable(name, "Display name", DISPLAY_NAME_MIN, DISPLAY_NAME_MAX)?;
        }
        if let Some(pronouns) = self.pronouns {
            account.pronouns = clearable(pronouns, "Pronouns", 1, PRONOUNS_MAX)?;
        }
        if let Some(bio) = self.bio {
            account.bio = clearable(bio, "Bio", 1, BIO_MAX)?;
        }
        if let Some(avatar) = self.avatar_hash {
            let avatar = avatar.trim();
            account.avatar_hash = if avatar.is_empty() {
                DEFAULT_AVATAR.to_string()
            } else {
                avatar.to_string()
            };
        }
        Ok(())
    }
}

fn clearable(value: String, field: &str, min: usize, max: usize) -> IdpResult<Option<String>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let len = value.chars().count();
    if len < min || len > max {
        return Err(IdpError::Validation(format!(
            "{} must be between {} and {} characters",
            field, min, max
        )));
    }
    Ok(Some(value.to_string()))
}

pub fn validate_username(username: &str) -> IdpResult<()> {
    if !USERNAME_RE.is_match(username) {
        return Err(IdpError::Validation(
            "Username must be 3-32 characters of letters, digits, '_', '.' or '-'".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> IdpResult<()> {
    let len = password.chars().count();
    if !(PASSWORD_MIN..=PASSWORD_MAX).contains(&len) {
        return Err(IdpError::Validation(format!(
            "Password must be between {} and {} characters",
            PASSWORD_MIN, PASSWORD_MAX
        )));
    }
    Ok(())
}

/// Display name given at registration
pub fn validate_display_name(name: Option<String>) -> IdpResult<Option<String>> {
    match name {
        Some(name) => clearable(name, "Display name", DISPLAY_NAME_MIN, DISPLAY_NAME_MAX),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            id: "acct".to_string(),
            username: "alice".to_string(),
            display_name: Some("Alice".to_string()),
            avatar_hash: DEFAULT_AVATAR.to_string(),
            pronouns: None,
            bio: None,
            authorized_apps: BTreeSet::new(),
            created_at: 0,
        }
    }

    #[test]
    fn test_username_rules() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("a.b-c_d").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"x".repeat(33)).is_err());
    }

    #[test]
    fn test_password_length() {
        assert!(validate_password("hunter22").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password(&"p".repeat(129)).is_err());
    }

    #[test]
    fn test_patch_clears_and_validates() {
        let mut acct = account();
        ProfilePatch {
            display_name: Some(String::new()),
            pronouns: Some("she/her".to_string()),
            ..Default::default()
        }
        .apply(&mut acct)
        .unwrap();
        assert_eq!(acct.display_name, None);
        assert_eq!(acct.pronouns.as_deref(), Some("she/her"));

        let too_long = ProfilePatch {
            bio: Some("b".repeat(BIO_MAX + 1)),
            ..Default::default()
        };
        match too_long.apply(&mut acct).unwrap_err() {
            IdpError::Validation(_) => {}
            e => panic!("Expected validation error, got {:?}", e),
        }
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let acct: Account = serde_json::from_str(
            r#"{"id":"a","username":"bob","avatar_hash":"default","created_at":1}"#,
        )
        .unwrap();
        assert!(acct.authorized_apps.is_empty());
        assert!(acct.bio.is_none());
    }
}
