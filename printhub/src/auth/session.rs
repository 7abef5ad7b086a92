//! JWT session tokens and the session cookie.

use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use serde::{Deserialize, Serialize};

use crate::{
    api::models::users::{CurrentUser, Role},
    config::Config,
    errors::Error,
    types::UserId,
};

/// JWT session claims
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: UserId,
    pub email: String,
    pub display_name: Option<String>,
    pub roles: Vec<Role>,
    pub is_admin: bool,
    pub exp: i64,
    pub iat: i64,
}

impl SessionClaims {
    pub fn new(user: &CurrentUser, config: &Config) -> Self {
        let now = Utc::now();
        let exp = now + config.auth.security.jwt_expiry;

        Self {
            sub: user.id,
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            roles: user.roles.clone(),
            is_admin: user.is_admin,
            exp: exp.timestamp(),
            iat: now.timestamp(),
        }
    }
}

impl From<SessionClaims> for CurrentUser {
    fn from(claims: SessionClaims) -> Self {
        Self {
            id: claims.sub,
            email: claims.email,
            display_name: claims.display_name,
            roles: claims.roles,
            is_admin: claims.is_admin,
        }
    }
}

fn secret(config: &Config) -> Result<&[u8], Error> {
    config
        .secret_key
        .as_deref()
        .map(str::as_bytes)
        .ok_or_else(|| Error::Internal {
            operation: "JWT sessions: secret_key is required".to_string(),
        })
}

pub fn create_session_token(user: &CurrentUser, config: &Config) -> Result<String, Error> {
    let claims = SessionClaims::new(user, config);
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret(config)?)).map_err(|e| Error::Internal {
        operation: format!("create JWT: {e}"),
    })
}

fn decode_claims(token: &str, config: &Config, leeway_secs: u64) -> Result<SessionClaims, Error> {
    let mut validation = Validation::default();
    validation.leeway = leeway_secs;

    decode::<SessionClaims>(token, &DecodingKey::from_secret(secret(config)?), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::ExpiredSignature
            | ErrorKind::MissingRequiredClaim(_)
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidSubject
            | ErrorKind::ImmatureSignature
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_)
            | ErrorKind::InvalidAlgorithm => Error::Unauthenticated { message: None },
            _ => Error::Internal {
                operation: format!("JWT verification: {e}"),
            },
        })
}

/// Verify and decode a live session token
pub fn verify_session_token(token: &str, config: &Config) -> Result<CurrentUser, Error> {
    decode_claims(token, config, 0).map(CurrentUser::from)
}

/// Accept a token that expired less than `refresh_grace` ago. Only the user id should be trusted;
/// the caller reloads roles from the database before issuing a new token.
pub fn verify_for_refresh(token: &str, config: &Config) -> Result<UserId, Error> {
    decode_claims(token, config, config.auth.security.refresh_grace.as_secs()).map(|claims| claims.sub)
}

/// `Set-Cookie` value carrying a session token
pub fn session_cookie(token: &str, config: &Config) -> String {
    let session = &config.auth.native.session;
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite={}; Max-Age={}",
        session.cookie_name,
        token,
        same_site(&session.cookie_same_site),
        session.timeout.as_secs()
    );
    if session.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value that removes the session cookie
pub fn clear_session_cookie(config: &Config) -> String {
    let session = &config.auth.native.session;
    let mut cookie = format!(
        "{}=; Path=/; HttpOnly; SameSite={}; Max-Age=0",
        session.cookie_name,
        same_site(&session.cookie_same_site)
    );
    if session.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn same_site(value: &str) -> &'static str {
    match value.to_ascii_lowercase().as_str() {
        "strict" => "Strict",
        "none" => "None",
        _ => "Lax",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn test_config() -> Config {
        let mut config = Config {
            secret_key: Some("test-secret-key-for-jwt".to_string()),
            ..Default::default()
        };
        config.auth.security.jwt_expiry = Duration::from_secs(3600);
        config.auth.security.refresh_grace = Duration::from_secs(7 * 24 * 3600);
        config
    }

    fn test_user() -> CurrentUser {
        CurrentUser {
            id: Uuid::new_v4(),
            email: "test@example.com".to_string(),
            display_name: Some("Test User".to_string()),
            roles: vec![Role::Customer, Role::PrintOperator],
            is_admin: false,
        }
    }

    fn token_with_exp(user: &CurrentUser, config: &Config, exp: chrono::DateTime<Utc>) -> String {
        let claims = SessionClaims {
            sub: user.id,
            email: user.email.clone(),
            display_name: None,
            roles: user.roles.clone(),
            is_admin: user.is_admin,
            exp: exp.timestamp(),
            iat: Utc::now().timestamp(),
        };
        let key = EncodingKey::from_secret(config.secret_key.as_ref().unwrap().as_bytes());
        encode(&Header::default(), &claims, &key).unwrap()
    }

    #[test]
    fn test_create_and_verify_session_token() {
        let config = test_config();
        let user = test_user();

        let token = create_session_token(&user, &config).unwrap();
        let verified = verify_session_token(&token, &config).unwrap();

        assert_eq!(verified.id, user.id);
        assert_eq!(verified.email, user.email);
        assert_eq!(verified.roles, user.roles);
        assert_eq!(verified.display_name, user.display_name);
    }

    #[test]
    fn test_wrong_secret_is_unauthenticated() {
        let mut config = test_config();
        let token = create_session_token(&test_user(), &config).unwrap();

        config.secret_key = Some("different-secret".to_string());
        assert!(matches!(
            verify_session_token(&token, &config),
            Err(Error::Unauthenticated { .. })
        ));
    }

    #[test]
    fn test_malformed_tokens_are_unauthenticated() {
        let config = test_config();
        for token in ["not.a.token", "invalid", "", "too.many.parts.in.this.token"] {
            assert!(
                matches!(verify_session_token(token, &config), Err(Error::Unauthenticated { .. })),
                "token: {token}"
            );
        }
    }

    #[test]
    fn test_expired_token_can_only_be_refreshed_within_grace() {
        let config = test_config();
        let user = test_user();

        let recently_expired = token_with_exp(&user, &config, Utc::now() - chrono::Duration::hours(2));
        assert!(matches!(
            verify_session_token(&recently_expired, &config),
            Err(Error::Unauthenticated { .. })
        ));
        assert_eq!(verify_for_refresh(&recently_expired, &config).unwrap(), user.id);

        let long_expired = token_with_exp(&user, &config, Utc::now() - chrono::Duration::days(8));
        assert!(verify_for_refresh(&long_expired, &config).is_err());
    }

    #[test]
    fn test_cookie_attributes() {
        let mut config = test_config();
        let cookie = session_cookie("abc", &config);
        assert!(cookie.starts_with("printhub_session=abc; Path=/; HttpOnly; SameSite=Lax"));
        assert!(cookie.ends_with("; Secure"));

        config.auth.native.session.cookie_secure = false;
        config.auth.native.session.cookie_same_site = "strict".to_string();
        let cleared = clear_session_cookie(&config);
        assert_eq!(cleared, "printhub_session=; Path=/; HttpOnly; SameSite=Strict; Max-Age=0");
    }
}
