/// HMAC signing of authorize request parameters
use crate::error::{IdpError, IdpResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Signs `redirect_uri|scope|client_id` so those parameters cannot be edited
/// between the sign and authorize steps
#[derive(Clone)]
pub struct ParamSigner {
    secret: Vec<u8>,
}

impl ParamSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    pub fn sign(&self, redirect_uri: &str, scope: &str, client_id: &str) -> IdpResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| IdpError::Internal(format!("Invalid HMAC key: {}", e)))?;
        mac.update(format!("{}|{}|{}", redirect_uri, scope, client_id).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time comparison against the expected signature
    pub fn verify(
        &self,
        redirect_uri: &str,
        scope: &str,
        client_id: &str,
        signature: &str,
    ) -> IdpResult<()> {
        let expected = self.sign(redirect_uri, scope, client_id)?;
        let provided = signature.trim().to_ascii_lowercase();

        if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
            Ok(())
        } else {
            Err(IdpError::Integrity(
                "Authorization parameters were tampered with".to_string(),
            ))
        }
    }
}
