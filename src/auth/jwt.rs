// src/auth/jwt.rs
use crate::auth::Claims;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

const TOKEN_EXPIRY_HOURS: i64 = 24;
const MAX_TOKEN_LEN: usize = 2048;

/// Signs a token for an existing account. Issuing credentials is left to the
/// operator's identity provider; this is used by tooling and tests.
pub fn generate_token(
    secret: &str,
    user_id: i64,
    username: &str,
    role_id: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role_id,
        exp: (now + Duration::hours(TOKEN_EXPIRY_HOURS)).timestamp() as usize,
        iat: now.timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn validate_token(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    if token.is_empty() || token.len() > MAX_TOKEN_LEN {
        return Err(jsonwebtoken::errors::ErrorKind::InvalidToken.into());
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = true;

    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?
    .claims;

    if claims.sub <= 0 {
        return Err(jsonwebtoken::errors::ErrorKind::InvalidToken.into());
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test_secret_key_minimum_32_characters_long_12345";

    #[test]
    fn test_token_round_trip_keeps_role() {
        let token = generate_token(SECRET, 3, "ops", 0).unwrap();
        let claims = validate_token(SECRET, &token).unwrap();

        assert_eq!(claims.sub, 3);
        assert_eq!(claims.username, "ops");
        assert_eq!(claims.role_id, 0);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = generate_token(SECRET, 3, "ops", 1).unwrap();
        assert!(validate_token("another_secret_that_is_long_enough_000", &token).is_err());
        assert!(validate_token(SECRET, "").is_err());
    }
}
