use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::auth::{Role, session, token};
use crate::error::ApiError;
use crate::store::AppState;

/// Authenticated operator extracted from a request. The JWT carries subject,
/// name, role, and the auth-session id; the session row is the revocation
/// authority.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub session_id: String,
    pub ip_addr: Option<String>,
}

impl AuthUser {
    pub fn require(&self, resource: &str, action: &str) -> Result<(), ApiError> {
        if crate::auth::check_permission(self.role, resource, action) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

/// Validate a raw bearer token: JWT signature + expiry, then the session row
/// (the revocation authority). Shared by the header extractor and the
/// WebSocket upgrade path, where browsers pass the token as a query param.
pub async fn authenticate_token(
    state: &AppState,
    raw: &str,
    ip_addr: Option<String>,
) -> Result<AuthUser, ApiError> {
    let claims = token::verify_token(&state.config.jwt.secret, raw)
        .map_err(|_| ApiError::Unauthenticated)?;

    if !session::is_active(&state.db, &claims.sid)
        .await
        .map_err(ApiError::Internal)?
    {
        return Err(ApiError::Unauthenticated);
    }

    let role: Role = claims.role.parse().map_err(|_| ApiError::Unauthenticated)?;

    Ok(AuthUser {
        user_id: claims.sub,
        username: claims.name,
        role,
        session_id: claims.sid,
        ip_addr,
    })
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let ip_addr = extract_ip(parts, state.config.server.trust_proxy_headers);
        let raw = extract_bearer_token(parts).ok_or(ApiError::Unauthenticated)?;
        authenticate_token(state, &raw, ip_addr).await
    }
}

fn extract_bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_owned())
}

fn extract_ip(parts: &Parts, trust_proxy: bool) -> Option<String> {
    // Only trust X-Forwarded-For when behind a configured reverse proxy
    if trust_proxy
        && let Some(forwarded) = parts.headers.get("x-forwarded-for")
        && let Ok(val) = forwarded.to_str()
        && let Some(first_ip) = val.split(',').next()
    {
        return Some(first_ip.trim().to_owned());
    }
    parts
        .extensions
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn make_parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/test");
        for &(k, v) in headers {
            builder = builder.header(k, v);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[test]
    fn bearer_token_valid() {
        let parts = make_parts(&[("authorization", "Bearer abc123")]);
        assert_eq!(extract_bearer_token(&parts), Some("abc123".into()));
    }

    #[test]
    fn bearer_token_missing_header() {
        let parts = make_parts(&[]);
        assert_eq!(extract_bearer_token(&parts), None);
    }

    #[test]
    fn bearer_token_wrong_scheme() {
        let parts = make_parts(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert_eq!(extract_bearer_token(&parts), None);
    }

    #[test]
    fn bearer_token_empty_after_prefix() {
        let parts = make_parts(&[("authorization", "Bearer ")]);
        assert_eq!(extract_bearer_token(&parts), None);
    }

    #[test]
    fn ip_from_forwarded_for_trusted() {
        let parts = make_parts(&[("x-forwarded-for", "1.2.3.4, 5.6.7.8")]);
        assert_eq!(extract_ip(&parts, true), Some("1.2.3.4".into()));
    }

    #[test]
    fn ip_forwarded_for_ignored_when_not_trusted() {
        let parts = make_parts(&[("x-forwarded-for", "1.2.3.4")]);
        assert_eq!(extract_ip(&parts, false), None);
    }

    #[test]
    fn ip_from_connect_info() {
        let mut parts = make_parts(&[]);
        let addr: std::net::SocketAddr = "127.0.0.1:9000".parse().unwrap();
        parts.extensions.insert(axum::extract::ConnectInfo(addr));
        assert_eq!(extract_ip(&parts, false), Some("127.0.0.1".into()));
    }
}
