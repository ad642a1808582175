/// Time-based one-time codes and backup codes
use crate::error::{IdpError, IdpResult};
use rand::{rngs::OsRng, RngCore};
use totp_rs::{Algorithm, TOTP};

/// Seed length in bytes
pub const SECRET_LEN: usize = 20;
/// Backup codes issued per enrollment
pub const BACKUP_CODE_COUNT: usize = 10;

const DIGITS: usize = 6;
/// Steps of tolerance on either side of the current one
const SKEW: u8 = 1;
const STEP_SECS: u64 = 30;

pub fn generate_secret() -> Vec<u8> {
    let mut secret = vec![0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Base32 form shown to the user for manual entry
pub fn encode_secret(secret: &[u8]) -> String {
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, secret)
}

fn build(secret: &[u8], issuer: Option<String>, account: &str) -> IdpResult<TOTP> {
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        STEP_SECS,
        secret.to_vec(),
        issuer,
        account.to_string(),
    )
    .map_err(|e| IdpError::Internal(format!("TOTP init error: {}", e)))
}

/// `otpauth://` URL for authenticator apps
pub fn provisioning_url(secret: &[u8], issuer: &str, account: &str) -> IdpResult<String> {
    Ok(build(secret, Some(issuer.to_string()), account)?.get_url())
}

/// Check `code` at `unix_secs`, tolerating one step of clock skew
pub fn verify_code(secret: &[u8], code: &str, unix_secs: u64) -> IdpResult<bool> {
    let code = code.trim();
    if code.len() != DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
        return Ok(false);
    }
    Ok(build(secret, None, "verify")?.check(code, unix_secs))
}

/// Code for `unix_secs`
pub fn code_at(secret: &[u8], unix_secs: u64) -> IdpResult<String> {
    Ok(build(secret, None, "generate")?.generate(unix_secs))
}

pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Ten 8-character hex codes
pub fn generate_backup_codes() -> Vec<String> {
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let mut bytes = [0u8; 4];
            OsRng.fill_bytes(&mut bytes);
            hex::encode(bytes)
        })
        .collect()
}

/// Whether `code` has the shape of a backup code rather than a TOTP
pub fn looks_like_backup_code(code: &str) -> bool {
    let code = code.trim();
    code.len() == 8 && code.chars().all(|c| c.is_ascii_hexdigit())
}
