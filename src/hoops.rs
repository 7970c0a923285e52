//! Request-scoped `Handler`s (middleware), mirroring the donor's
//! `auth::hoops` / `utils::logger` split: small `#[handler]` functions
//! plus a `Depot` extension trait for the values they stash.

use salvo::prelude::*;

use crate::auth::{AuthIdentity, Authenticator, JwtCookieAuth};

const DEPOT_AUTH_KEY: &str = "auth_identity";

#[allow(unused)]
pub trait DepotAuthExt {
    fn auth_identity(&self) -> &AuthIdentity;
}

impl DepotAuthExt for Depot {
    fn auth_identity(&self) -> &AuthIdentity {
        self.get::<AuthIdentity>(DEPOT_AUTH_KEY)
            .expect("needs auth_hoop")
    }
}

/// Resolves the caller's identity and stashes it in the depot. Always
/// succeeds — an unresolvable identity is anonymous (§4.4); whether that is
/// acceptable is decided downstream by `require_auth_sse`/`require_auth_notify`.
#[handler]
pub fn auth_hoop(req: &mut Request, depot: &mut Depot) {
    let identity = JwtCookieAuth.authenticate(req);
    depot.insert(DEPOT_AUTH_KEY, identity);
}
