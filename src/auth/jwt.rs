use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use super::{TokenError, TokenValidator, UserContext};

/// Claims issued by the auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
}

/// HS256 validator sharing a secret with the auth service.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_nbf = true;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

impl TokenValidator for JwtValidator {
    fn validate_token(&self, token: &str) -> Result<UserContext, TokenError> {
        let data = decode::<TokenClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            }
        })?;
        let claims = data.claims;

        if claims.user_id.is_empty() {
            return Err(TokenError::Invalid("user_id claim is required".to_string()));
        }
        if claims.email.is_empty() {
            return Err(TokenError::Invalid("email claim is required".to_string()));
        }

        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .ok_or_else(|| TokenError::Invalid("exp claim out of range".to_string()))?;
        let issued_at = claims.iat.and_then(|iat| DateTime::<Utc>::from_timestamp(iat, 0));

        Ok(UserContext {
            user_id: claims.user_id,
            email: claims.email,
            token_type: "JWT".to_string(),
            issued_at,
            expires_at,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "test-secret-that-is-at-least-32-chars!";

    fn sign(claims: &TokenClaims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(exp_offset: i64) -> TokenClaims {
        let now = Utc::now().timestamp();
        TokenClaims {
            user_id: "user-42".to_string(),
            email: "ops@example.com".to_string(),
            exp: now + exp_offset,
            iat: Some(now),
            nbf: None,
        }
    }

    #[test]
    fn test_valid_token() {
        let validator = JwtValidator::new(SECRET);
        let token = sign(&claims(3600), SECRET);

        let user = validator.validate_token(&token).unwrap();
        assert_eq!(user.user_id, "user-42");
        assert_eq!(user.email, "ops@example.com");
        assert_eq!(user.token_type, "JWT");
        assert!(user.issued_at.is_some());
        assert!(user.expires_at > Utc::now());
    }

    #[test]
    fn test_expired_token() {
        let validator = JwtValidator::new(SECRET);
        let token = sign(&claims(-60), SECRET);

        assert_eq!(validator.validate_token(&token), Err(TokenError::Expired));
    }

    #[test]
    fn test_wrong_secret_is_invalid() {
        let validator = JwtValidator::new(SECRET);
        let token = sign(&claims(3600), "another-secret-that-is-long-enough!!");

        assert!(matches!(
            validator.validate_token(&token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn test_not_yet_valid_is_invalid() {
        let validator = JwtValidator::new(SECRET);
        let mut future = claims(7200);
        future.nbf = Some(Utc::now().timestamp() + 3600);

        assert!(matches!(
            validator.validate_token(&sign(&future, SECRET)),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_identity_claims_are_invalid() {
        let validator = JwtValidator::new(SECRET);

        let mut no_user = claims(3600);
        no_user.user_id.clear();
        let err = validator.validate_token(&sign(&no_user, SECRET)).unwrap_err();
        assert!(err.to_string().contains("user_id"));

        let mut no_email = claims(3600);
        no_email.email.clear();
        let err = validator.validate_token(&sign(&no_email, SECRET)).unwrap_err();
        assert!(err.to_string().contains("email"));
    }

    #[test]
    fn test_garbage_is_invalid() {
        let validator = JwtValidator::new(SECRET);
        assert!(matches!(
            validator.validate_token("not-a-jwt"),
            Err(TokenError::Invalid(_))
        ));
    }
}
