use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by the identity provider's HS256 tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token: {0}")]
    Invalid(String),
}

/// Verifies bearer identity tokens. Sign-in itself happens elsewhere.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify the value of an `Authorization` header.
    pub fn verify_header(&self, header: Option<&str>) -> Result<Identity, AuthError> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            tracing::debug!("identity token rejected: {:?}", e);
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::Invalid("signature mismatch".into()),
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        Ok(Identity {
            user_id: claims.sub,
            email: claims.email,
            name: claims.name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{issue_token, TEST_SECRET};

    #[test]
    fn test_valid_token() {
        let verifier = TokenVerifier::new(TEST_SECRET);
        let token = issue_token(TEST_SECRET, "user-42", 3600);
        let header = format!("Bearer {}", token);
        let identity = verifier.verify_header(Some(&header)).unwrap();
        assert_eq!(identity.user_id, "user-42");
        assert_eq!(identity.email.as_deref(), Some("user-42@example.com"));
    }

    #[test]
    fn test_missing_and_malformed() {
        let verifier = TokenVerifier::new(TEST_SECRET);
        assert_eq!(verifier.verify_header(None), Err(AuthError::MissingToken));
        assert_eq!(
            verifier.verify_header(Some("Basic abc")),
            Err(AuthError::MissingToken)
        );
        assert!(matches!(
            verifier.verify_header(Some("Bearer not-a-jwt")),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_wrong_secret_and_expiry() {
        let verifier = TokenVerifier::new(TEST_SECRET);
        let forged = issue_token("other-secret", "user-42", 3600);
        assert!(matches!(verifier.verify(&forged), Err(AuthError::Invalid(_))));

        let stale = issue_token(TEST_SECRET, "user-42", -3600);
        assert_eq!(verifier.verify(&stale), Err(AuthError::Expired));
    }
}
