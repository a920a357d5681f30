use crate::db::poll::UserId;
use actix_web::HttpRequest;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Resolves the authenticated user behind a connection, if any.
pub trait IdentityProvider: Send + Sync {
    fn identify(&self, req: &HttpRequest) -> Option<UserId>;
}

/// Trusts a header set by an authenticating proxy in front of the server.
#[derive(Clone, Debug)]
pub struct TrustedHeader {
    header: String,
}

impl TrustedHeader {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for TrustedHeader {
    fn default() -> Self {
        Self::new(USER_ID_HEADER)
    }
}

impl IdentityProvider for TrustedHeader {
    fn identify(&self, req: &HttpRequest) -> Option<UserId> {
        req.headers()
            .get(self.header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(UserId::from)
    }
}

/// Network origin used as the voter id of anonymous connections.
pub fn origin(req: &HttpRequest) -> Option<String> {
    req.peer_addr().map(|addr| addr.ip().to_string())
}
