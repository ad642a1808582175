/// RS256 bearer tokens
///
/// Session tokens: `iss` = `aud` = issuer, `sub` = account id, `jti` = session id.
/// Access tokens: `iss` = issuer, `aud` = client id, `sub` = account id, plus
/// the granted scope bitmap as a decimal string.
use crate::error::{IdpError, IdpResult};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const JWT_ALGORITHM: Algorithm = Algorithm::RS256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub jti: String,
    pub scope: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signs and verifies bearer tokens with the deployment key pair
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl TokenSigner {
    /// Load the key pair; malformed keys abort startup
    pub fn from_pem(private_pem: &str, public_pem: &str, issuer: &str) -> IdpResult<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| IdpError::Startup(format!("Invalid JWT private key: {}", e)))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| IdpError::Startup(format!("Invalid JWT public key: {}", e)))?;

        let signer = Self {
            encoding_key,
            decoding_key,
            issuer: issuer.to_string(),
        };

        // Reject a pair whose halves do not belong together
        let check_expiry = chrono::Utc::now().timestamp_millis() + 60_000;
        let check = signer.sign_session("startup-check", "startup-check", check_expiry)?;
        signer
            .verify_session(&check)
            .map_err(|_| IdpError::Startup("JWT private and public keys do not match".to_string()))?;

        Ok(signer)
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Session token expiring at `expires_at_ms`
    pub fn sign_session(
        &self,
        account_id: &str,
        session_id: &str,
        expires_at_ms: i64,
    ) -> IdpResult<String> {
        let claims = SessionClaims {
            iss: self.issuer.clone(),
            aud: self.issuer.clone(),
            sub: account_id.to_string(),
            jti: session_id.to_string(),
            iat: chrono::Utc::now().timestamp(),
            exp: expires_at_ms / 1000,
        };

        encode(&Header::new(JWT_ALGORITHM), &claims, &self.encoding_key)
            .map_err(|e| IdpError::Jwt(format!("Failed to sign session token: {}", e)))
    }

    pub fn verify_session(&self, token: &str) -> IdpResult<SessionClaims> {
        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.issuer]);

        decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    /// Access token for `client_id`; returns the token and its `exp` in seconds
    pub fn sign_access(
        &self,
        account_id: &str,
        client_id: &str,
        scope: u64,
        ttl: std::time::Duration,
    ) -> IdpResult<(String, i64)> {
        let now = chrono::Utc::now().timestamp();
        let exp = now + ttl.as_secs() as i64;
        let claims = AccessClaims {
            iss: self.issuer.clone(),
            aud: client_id.to_string(),
            sub: account_id.to_string(),
            jti: Uuid::new_v4().simple().to_string(),
            scope: scope.to_string(),
            iat: now,
            exp,
        };

        let token = encode(&Header::new(JWT_ALGORITHM), &claims, &self.encoding_key)
            .map_err(|e| IdpError::Jwt(format!("Failed to sign access token: {}", e)))?;
        Ok((token, exp))
    }

    /// Verify an access token for any client; session tokens are rejected
    pub fn verify_access(&self, token: &str) -> IdpResult<AccessClaims> {
        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.set_issuer(&[&self.issuer]);
        // Audience is the client, checked by the caller against the account
        validation.validate_aud = false;

        let claims = decode::<AccessClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)?;

        if claims.aud == self.issuer {
            return Err(IdpError::Authentication("Not an access token".to_string()));
        }

        Ok(claims)
    }
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> IdpError {
    tracing::debug!("JWT verification failed: {}", e);
    match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            IdpError::Authentication("Token has expired".to_string())
        }
        jsonwebtoken::errors::ErrorKind::InvalidSignature => {
            IdpError::Authentication("Invalid token signature".to_string())
        }
        _ => IdpError::Authentication("Invalid token".to_string()),
    }
}
