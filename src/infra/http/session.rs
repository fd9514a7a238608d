//! Signed cookie carrying the cached-content access token.

use axum::http::{HeaderMap, HeaderValue, header::SET_COOKIE};
use axum::response::IntoResponse;
use axum_extra::extract::cookie::{Cookie, Key, SameSite, SignedCookieJar};

use crate::application::auth::AuthSession;

pub const SESSION_COOKIE_NAME: &str = "marimo_gateway_session";

/// Loads and stores [`AuthSession`]s in a tamper-proof cookie.
#[derive(Clone)]
pub struct CookieSessions {
    key: Key,
}

impl std::fmt::Debug for CookieSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSessions").finish_non_exhaustive()
    }
}

impl CookieSessions {
    /// Sessions signed with a key generated for this process.
    pub fn generate() -> Self {
        Self {
            key: Key::generate(),
        }
    }

    pub fn load(&self, headers: &HeaderMap) -> AuthSession {
        let jar = SignedCookieJar::from_headers(headers, self.key.clone());
        AuthSession::new(
            jar.get(SESSION_COOKIE_NAME)
                .map(|cookie| cookie.value().to_string())
                .filter(|token| !token.is_empty()),
        )
    }

    /// Append `Set-Cookie` for a changed session; unchanged sessions are left alone.
    pub fn persist(&self, session: &AuthSession, headers: &mut HeaderMap) {
        if !session.is_changed() {
            return;
        }
        let Some(token) = session.access_token() else {
            return;
        };

        let cookie = Cookie::build((SESSION_COOKIE_NAME, token.to_string()))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .build();
        let jar = SignedCookieJar::new(self.key.clone()).add(cookie);
        let response = jar.into_response();
        let values: Vec<HeaderValue> = response.headers().get_all(SET_COOKIE).iter().cloned().collect();
        for value in values {
            headers.append(SET_COOKIE, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::header::COOKIE;

    fn cookie_header(set_cookie: &HeaderValue) -> HeaderValue {
        let pair = set_cookie.to_str().unwrap().split(';').next().unwrap().to_string();
        HeaderValue::from_str(&pair).unwrap()
    }

    #[test]
    fn persisted_token_round_trips_through_the_cookie() {
        let sessions = CookieSessions::generate();
        let mut session = AuthSession::default();
        session.set_access_token("T");

        let mut response_headers = HeaderMap::new();
        sessions.persist(&session, &mut response_headers);
        let set_cookie = response_headers.get(SET_COOKIE).unwrap();
        assert!(set_cookie.to_str().unwrap().contains("HttpOnly"));

        let mut request_headers = HeaderMap::new();
        request_headers.insert(COOKIE, cookie_header(set_cookie));
        let loaded = sessions.load(&request_headers);
        assert_eq!(loaded.access_token(), Some("T"));
        assert!(!loaded.is_changed());
    }

    #[test]
    fn forged_cookie_is_ignored() {
        let sessions = CookieSessions::generate();
        let mut request_headers = HeaderMap::new();
        request_headers.insert(
            COOKIE,
            HeaderValue::from_static("marimo_gateway_session=T"),
        );
        assert_eq!(sessions.load(&request_headers).access_token(), None);
    }

    #[test]
    fn unchanged_session_sets_no_cookie() {
        let sessions = CookieSessions::generate();
        let mut headers = HeaderMap::new();
        sessions.persist(&AuthSession::new(Some("T".to_string())), &mut headers);
        assert!(headers.get(SET_COOKIE).is_none());
    }
}
