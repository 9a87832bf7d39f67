//! Session cookie handling and the authenticated-user extractor.

use axum::extract::FromRequestParts;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use tracing::debug;

use super::error::WebError;
use super::AppState;
use crate::auth::{self, RequestContext, SESSION_DAYS};

pub const COOKIE_NAME: &str = "remember_user";

const SESSION_MAX_AGE_SECS: i64 = SESSION_DAYS * 24 * 60 * 60;

/// Value of cookie `name` across all `Cookie` headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie(token: &str) -> String {
    format!("{COOKIE_NAME}={token}; Max-Age={SESSION_MAX_AGE_SECS}; Path=/; HttpOnly; SameSite=Lax")
}

pub fn clear_cookie() -> String {
    format!("{COOKIE_NAME}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax")
}

fn to_login(clear: bool) -> Response {
    if clear {
        ([(SET_COOKIE, clear_cookie())], Redirect::to("/login")).into_response()
    } else {
        Redirect::to("/login").into_response()
    }
}

/// The signed-in user. Protected handlers take this as an argument;
/// requests without a live session are redirected to `/login`.
pub struct CurrentUser(pub RequestContext);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = cookie_value(&parts.headers, COOKIE_NAME) else {
            return Err(to_login(false));
        };
        let resolved = state
            .run_blocking(move |db| auth::resolve_session(db, &token))
            .await;
        match resolved {
            Ok(Some(ctx)) => Ok(CurrentUser(ctx)),
            Ok(None) => {
                debug!(path = %parts.uri.path(), "stale session cookie");
                Err(to_login(true))
            }
            Err(e) => Err(WebError::from(e).into_response()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_cookie_value_parses_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark; remember_user=abc-123"));
        assert_eq!(cookie_value(&headers, COOKIE_NAME).as_deref(), Some("abc-123"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_cookie_value_ignores_empty() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("remember_user="));
        assert_eq!(cookie_value(&headers, COOKIE_NAME), None);
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("tok");
        assert!(cookie.starts_with("remember_user=tok;"));
        assert!(cookie.contains("Max-Age=2592000"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(clear_cookie().contains("Max-Age=0"));
    }
}
