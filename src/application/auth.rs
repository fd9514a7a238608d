//! Access control for cached content.

use subtle::ConstantTimeEq;

/// Query parameter carrying the access token.
pub const TOKEN_QUERY_PARAM: &str = "access_token";

/// Token state stored in the client's session cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSession {
    access_token: Option<String>,
    changed: bool,
}

impl AuthSession {
    pub fn new(access_token: Option<String>) -> Self {
        Self {
            access_token,
            changed: false,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.access_token = Some(token.into());
        self.changed = true;
    }

    /// Whether the session must be written back to the client.
    pub fn is_changed(&self) -> bool {
        self.changed
    }
}

/// Single-token check guarding cached renders.
#[derive(Clone, Default)]
pub struct CacheAuthorizer {
    token: Option<String>,
}

impl std::fmt::Debug for CacheAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAuthorizer")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl CacheAuthorizer {
    /// An absent or empty token disables the check.
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|token| !token.is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Authorize via the session token, then via the query token; a query
    /// match is remembered in the session.
    pub fn authorize(&self, session: &mut AuthSession, query_token: Option<&str>) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return true;
        };

        if session
            .access_token()
            .is_some_and(|token| token_matches(token, expected))
        {
            return true;
        }

        if query_token.is_some_and(|token| token_matches(token, expected)) {
            session.set_access_token(expected);
            return true;
        }

        false
    }
}

fn token_matches(candidate: &str, expected: &str) -> bool {
    candidate.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_configured_token_authorizes_everything() {
        for authorizer in [CacheAuthorizer::new(None), CacheAuthorizer::new(Some(String::new()))] {
            let mut session = AuthSession::default();
            assert!(!authorizer.is_enabled());
            assert!(authorizer.authorize(&mut session, None));
            assert!(authorizer.authorize(&mut session, Some("anything")));
            assert!(!session.is_changed());
        }
    }

    #[test]
    fn query_token_authorizes_and_is_remembered() {
        let authorizer = CacheAuthorizer::new(Some("T".to_string()));
        let mut session = AuthSession::default();

        assert!(authorizer.authorize(&mut session, Some("T")));
        assert_eq!(session.access_token(), Some("T"));
        assert!(session.is_changed());

        let mut returning = AuthSession::new(session.access_token().map(str::to_string));
        assert!(authorizer.authorize(&mut returning, None));
        assert!(!returning.is_changed());
    }

    #[test]
    fn wrong_or_missing_token_is_rejected() {
        let authorizer = CacheAuthorizer::new(Some("T".to_string()));

        let mut session = AuthSession::default();
        assert!(!authorizer.authorize(&mut session, Some("WRONG")));
        assert_eq!(session.access_token(), None);

        assert!(!authorizer.authorize(&mut session, None));

        let mut stale = AuthSession::new(Some("old".to_string()));
        assert!(!authorizer.authorize(&mut stale, None));
        assert!(!authorizer.authorize(&mut stale, Some("")));
    }
}
