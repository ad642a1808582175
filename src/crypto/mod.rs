/// Cryptographic primitives
///
/// Password hashing, sealed secrets, bearer token signing, signed request
/// parameters, one-time codes and random identifiers.

pub mod password;
pub mod secret_box;
pub mod signing;
pub mod tokens;
pub mod totp;

use rand::{rngs::OsRng, RngCore};

/// `len` random bytes, hex encoded
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Time-prefixed random identifier for accounts, identities and applications
///
/// The prefix is the creation time in base32 so ids sort roughly by age.
pub fn generate_id() -> String {
    let millis = crate::clock::now_ms().max(0) as u64;
    let bytes = millis.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    let prefix = base32::encode(
        base32::Alphabet::Rfc4648Lower { padding: false },
        &bytes[first..],
    );
    format!("{}{}", prefix, random_hex(4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_hex_length() {
        assert_eq!(random_hex(16).len(), 32);
        assert_eq!(random_hex(20).len(), 40);
        assert!(random_hex(32).chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_id_is_unique() {
        let ids: HashSet<String> = (0..200).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 200);
        assert!(ids
            .iter()
            .all(|id| id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())));
    }
}
