/// Password hashing and verification using Argon2id
use crate::error::{IdpError, IdpResult};
use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Argon2, PasswordHash, PasswordVerifier,
};
use rand::rngs::OsRng;

/// Hash a secret for storage
pub fn hash_password(password: &str) -> IdpResult<String> {
    let salt = SaltString::generate(&mut OsRng);

    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| IdpError::Internal(format!("Password hashing failed: {}", e)))?
        .to_string();

    Ok(hash)
}

/// Check a secret against a stored hash
pub fn verify_password(password: &str, hash: &str) -> IdpResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| IdpError::Internal(format!("Invalid password hash format: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse", &hash).unwrap());
        assert!(!verify_password("wrong horse", &hash).unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        assert_ne!(hash_password("same").unwrap(), hash_password("same").unwrap());
    }

    #[test]
    fn test_malformed_hash_is_an_error() {
        assert!(verify_password("x", "not-a-hash").is_err());
    }
}
