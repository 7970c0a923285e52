//! Pluggable authentication boundary.
//!
//! The hub itself never decides who a caller is; §1 calls authentication an
//! external collaborator. This module defines the trait that boundary takes
//! the shape of, plus two small implementations: [`NoAuth`] (always
//! anonymous, the default for tests and for deployments that don't gate the
//! notification endpoint) and [`JwtCookieAuth`], a illustrative
//! implementation grounded in the donor's own JWT cookie check
//! (`auth::hoops::access_hoop`) but without the session-table lookup, since
//! this crate has no persisted session store to check against.

use std::sync::LazyLock;

use salvo::Request;
use serde::{Deserialize, Serialize};

/// The resolved caller identity for one connection, or the absence of one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthIdentity {
    pub user_id: Option<String>,
}

impl AuthIdentity {
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Resolves an [`AuthIdentity`] from an incoming request.
///
/// Implementations must not fail: an unresolvable identity is always
/// `AuthIdentity::anonymous()`. Whether anonymous callers are turned away
/// is a deployment policy decision made by the HTTP entry points
/// (`require_auth_sse` / `require_auth_notify`), not by the authenticator.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, req: &Request) -> AuthIdentity;
}

/// Always anonymous. The default for the notification endpoint, and for
/// tests that don't exercise authentication.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn authenticate(&self, _req: &Request) -> AuthIdentity {
        AuthIdentity::anonymous()
    }
}

/// The JWT cookie name this implementation looks for.
pub const JWT_COOKIE_NAME: &str = "access_token";

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    sub: String,
    exp: usize,
}

static JWT_SECRET: LazyLock<[u8; 32]> = LazyLock::new(rand::random);

static JWT_DECODING_KEY: LazyLock<jsonwebtoken::DecodingKey> =
    LazyLock::new(|| jsonwebtoken::DecodingKey::from_secret(JWT_SECRET.as_slice()));

static JWT_ENCODING_KEY: LazyLock<jsonwebtoken::EncodingKey> =
    LazyLock::new(|| jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_slice()));

static JWT_VALIDATION: LazyLock<jsonwebtoken::Validation> =
    LazyLock::new(jsonwebtoken::Validation::default);

/// Issues a short-lived JWT for `user_id`, for use by callers wiring up
/// [`JwtCookieAuth`] in a test or demo harness.
pub fn issue_test_jwt(user_id: &str, ttl: std::time::Duration) -> String {
    let claims = JwtClaims {
        sub: user_id.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };
    jsonwebtoken::encode(&jsonwebtoken::Header::default(), &claims, &JWT_ENCODING_KEY)
        .expect("encoding a well-formed claim set never fails")
}

/// Resolves identity from a JWT stored in the [`JWT_COOKIE_NAME`] cookie.
///
/// Unlike the donor's `access_hoop`, there is no session table to
/// cross-check the token against — the JWT's signature and expiry are the
/// whole trust boundary here. A missing cookie or an invalid/expired token
/// both resolve to anonymous rather than rejecting the request outright;
/// callers that require authentication enforce that via `require_auth_*`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JwtCookieAuth;

impl Authenticator for JwtCookieAuth {
    fn authenticate(&self, req: &Request) -> AuthIdentity {
        let Some(token) = req.cookie(JWT_COOKIE_NAME).map(|c| c.value().to_string())
        else {
            return AuthIdentity::anonymous();
        };
        match jsonwebtoken::decode::<JwtClaims>(&token, &JWT_DECODING_KEY, &JWT_VALIDATION) {
            Ok(data) => AuthIdentity {
                user_id: Some(data.claims.sub),
            },
            Err(err) => {
                tracing::debug!(error = %err, "rejected sse auth cookie");
                AuthIdentity::anonymous()
            }
        }
    }
}

/// Extracts `(user_agent_summary, ip)` from a request, for connection
/// metadata. Grounded in `auth::util::get_device_and_ip` in the donor.
pub fn device_and_ip(req: &Request) -> (Option<String>, Option<String>) {
    let device = req.header::<&str>("User-Agent").and_then(|ua| {
        woothee::parser::Parser::new()
            .parse(ua)
            .map(|info| format!("{} on {} ({})", info.name, info.os, info.category))
    });
    let ip = req
        .remote_addr()
        .to_owned()
        .into_std()
        .map(|addr| addr.ip().to_string());
    (device, ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_roundtrip_resolves_identity() {
        let token = issue_test_jwt("u1", std::time::Duration::from_secs(60));
        let claims = jsonwebtoken::decode::<JwtClaims>(&token, &JWT_DECODING_KEY, &JWT_VALIDATION)
            .unwrap()
            .claims;
        assert_eq!(claims.sub, "u1");
    }

    #[test]
    fn no_auth_is_always_anonymous() {
        assert!(!AuthIdentity::anonymous().is_authenticated());
    }
}
