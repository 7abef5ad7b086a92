use crate::{
    AppState,
    api::models::users::CurrentUser,
    auth::session,
    config::Config,
    errors::{Error, Result},
};
use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{header, request::Parts},
};
use tracing::{debug, instrument, trace};

/// Extractor for routes that serve guests as well as signed-in users
pub type MaybeUser = Option<CurrentUser>;

/// Session token from the session cookie, if present
pub fn session_token_from_cookie<'a>(parts: &'a Parts, config: &Config) -> Option<&'a str> {
    let cookie_str = parts.headers.get(header::COOKIE)?.to_str().ok()?;
    let cookie_name = &config.auth.native.session.cookie_name;

    cookie_str
        .split(';')
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, value)| name == cookie_name && !value.is_empty())
        .map(|(_, value)| value)
}

/// Session token from `Authorization: Bearer`, if present
pub fn session_token_from_header(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Authenticate from the cookie first, then the bearer header.
/// Returns:
/// - None: no credentials present
/// - Some(Ok(user)): a valid token was found
/// - Some(Err(error)): credentials were present but none verified
#[instrument(skip_all)]
fn authenticate(parts: &Parts, config: &Config) -> Option<Result<CurrentUser>> {
    let candidates = [session_token_from_cookie(parts, config), session_token_from_header(parts)];

    let mut last_error = None;
    for token in candidates.into_iter().flatten() {
        match session::verify_session_token(token, config) {
            Ok(user) => {
                debug!("Found session authenticated user: {}", user.id);
                return Some(Ok(user));
            }
            Err(e) => {
                trace!("Session token rejected: {:?}", e);
                last_error = Some(e);
            }
        }
    }
    last_error.map(Err)
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        if !state.config.auth.native.enabled {
            return Err(Error::Unauthenticated {
                message: Some("Authentication is disabled".to_string()),
            });
        }
        match authenticate(parts, &state.config) {
            Some(Ok(user)) => Ok(user),
            Some(Err(Error::Internal { operation })) => Err(Error::Internal { operation }),
            Some(Err(_)) => Err(Error::Unauthenticated {
                message: Some("Session is invalid or has expired".to_string()),
            }),
            None => Err(Error::Unauthenticated { message: None }),
        }
    }
}

/// `Option<CurrentUser>` for routes that also serve guests. Bad or expired tokens count as no user.
impl OptionalFromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Option<Self>> {
        if !state.config.auth.native.enabled {
            return Ok(None);
        }
        Ok(authenticate(parts, &state.config).and_then(|r| r.ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::users::Role,
        test_utils::{create_test_config, create_test_state},
    };
    use sqlx::PgPool;
    use uuid::Uuid;

    fn parts_with(name: &str, value: &str) -> Parts {
        let request = axum::http::Request::builder()
            .uri("http://localhost/api/orders")
            .header(name, value)
            .body(())
            .unwrap();
        request.into_parts().0
    }

    fn user() -> CurrentUser {
        CurrentUser {
            id: Uuid::new_v4(),
            email: "customer@example.com".to_string(),
            display_name: None,
            is_admin: false,
            roles: vec![Role::Customer],
        }
    }

    #[test]
    fn test_cookie_lookup_picks_named_cookie() {
        let config = create_test_config();
        let parts = parts_with("cookie", "theme=dark; printhub_session=tok123; other=1");
        assert_eq!(session_token_from_cookie(&parts, &config), Some("tok123"));

        let parts = parts_with("cookie", "printhub_session=");
        assert_eq!(session_token_from_cookie(&parts, &config), None);
    }

    #[sqlx::test]
    async fn test_bearer_and_cookie_authentication(pool: PgPool) {
        let state = create_test_state(pool, create_test_config());
        let user = user();
        let token = session::create_session_token(&user, &state.config).unwrap();

        let mut parts = parts_with("authorization", &format!("Bearer {token}"));
        let extracted = <CurrentUser as FromRequestParts<AppState>>::from_request_parts(&mut parts, &state)
            .await
            .unwrap();
        assert_eq!(extracted.id, user.id);

        let mut parts = parts_with("cookie", &format!("printhub_session={token}"));
        let extracted = <CurrentUser as FromRequestParts<AppState>>::from_request_parts(&mut parts, &state)
            .await
            .unwrap();
        assert_eq!(extracted.email, user.email);
    }

    #[sqlx::test]
    async fn test_invalid_token_required_vs_optional(pool: PgPool) {
        let state = create_test_state(pool, create_test_config());

        let mut parts = parts_with("authorization", "Bearer garbage");
        let err = <CurrentUser as FromRequestParts<AppState>>::from_request_parts(&mut parts, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthenticated { message: Some(_) }));

        let mut parts = parts_with("authorization", "Bearer garbage");
        let maybe = <CurrentUser as OptionalFromRequestParts<AppState>>::from_request_parts(&mut parts, &state)
            .await
            .unwrap();
        assert!(maybe.is_none());

        let mut parts = parts_with("x-unrelated", "1");
        let err = <CurrentUser as FromRequestParts<AppState>>::from_request_parts(&mut parts, &state)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthenticated { message: None }));
    }
}
