//! Partition-key strategies.
//!
//! A strategy maps a request to the *scope* that shares one counter (an IP address, a user id,
//! or anything a closure computes). The limiter namespaces the scope with the policy name, so
//! the final key is `"{policy}:{scope}"`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::{header, Extensions, HeaderMap, Method, Request, Uri};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::KeyError;

/// Scope used when no client address can be determined.
pub const UNKNOWN_SCOPE: &str = "unknown";
/// Scope used when no authenticated identity can be determined.
pub const ANONYMOUS_SCOPE: &str = "anonymous";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Transport-level peer address, inserted into request extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Identity established by an upstream authentication layer, inserted into request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Borrowed view of the parts of a request that key strategies may inspect.
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub extensions: &'a Extensions,
}

impl<'a, B> From<&'a Request<B>> for RequestHead<'a> {
    fn from(req: &'a Request<B>) -> Self {
        Self {
            method: req.method(),
            uri: req.uri(),
            headers: req.headers(),
            extensions: req.extensions(),
        }
    }
}

impl<'a> RequestHead<'a> {
    /// Best-effort client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
    /// transport peer.
    pub fn client_ip(&self) -> Option<String> {
        let forwarded = self
            .header_str(X_FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return Some(ip.to_string());
        }
        if let Some(ip) = self.header_str(X_REAL_IP).map(str::trim).filter(|v| !v.is_empty()) {
            return Some(ip.to_string());
        }
        self.extensions.get::<PeerAddr>().map(|peer| peer.0.ip().to_string())
    }

    /// `User-Agent` header, if present and valid UTF-8.
    pub fn user_agent(&self) -> Option<&'a str> {
        self.headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok())
    }

    fn header_str(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Decodes an authenticated identity from a request credential.
pub trait IdentityDecoder: Send + Sync + fmt::Debug {
    /// `Ok(None)` when no credential is present; `Err` when one is present but unusable.
    fn decode(&self, head: &RequestHead<'_>) -> Result<Option<String>, KeyError>;
}

/// Reads the (unverified) claims segment of an `Authorization: Bearer <jwt>` token.
///
/// Signature checks belong to the authentication layer; this decoder only partitions counters,
/// so a forged token can at most move its bearer into a different bucket.
#[derive(Debug, Clone)]
pub struct BearerClaims {
    claims: Vec<String>,
}

impl Default for BearerClaims {
    fn default() -> Self {
        Self::new(["sub", "userId", "id"])
    }
}

impl BearerClaims {
    /// Use the first present claim of `claims`, in order.
    pub fn new<I, S>(claims: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { claims: claims.into_iter().map(Into::into).collect() }
    }
}

impl IdentityDecoder for BearerClaims {
    fn decode(&self, head: &RequestHead<'_>) -> Result<Option<String>, KeyError> {
        let Some(raw) = head.headers.get(header::AUTHORIZATION) else {
            return Ok(None);
        };
        let raw = raw
            .to_str()
            .map_err(|_| KeyError::MalformedCredential("authorization header is not ASCII".into()))?;
        let Some(token) = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer ")) else {
            return Err(KeyError::MalformedCredential("expected a Bearer credential".into()));
        };

        let mut segments = token.trim().split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return Err(KeyError::MalformedCredential("token is not a JWT".into())),
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| KeyError::MalformedCredential(format!("claims are not base64url: {e}")))?;
        let claims: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| KeyError::MalformedCredential(format!("claims are not JSON: {e}")))?;

        let identity = self.claims.iter().find_map(|name| match claims.get(name) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        });
        match identity {
            Some(id) => Ok(Some(id)),
            None => Err(KeyError::MalformedCredential("token carries no identity claim".into())),
        }
    }
}

type ScopeFn = dyn Fn(&RequestHead<'_>) -> String + Send + Sync;

/// Rule that partitions counters by caller identity.
#[derive(Clone, Default)]
pub enum KeyStrategy {
    /// Client address; `"unknown"` when none can be found.
    #[default]
    Ip,
    /// Authenticated user; `"anonymous"` when there is none.
    User(Arc<dyn IdentityDecoder>),
    /// Caller-supplied scope function, e.g. IP plus route.
    Custom(Arc<ScopeFn>),
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Ip => f.write_str("Ip"),
            KeyStrategy::User(decoder) => f.debug_tuple("User").field(decoder).finish(),
            KeyStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl KeyStrategy {
    /// Per-user strategy using [`BearerClaims`] with its default claim list.
    pub fn user() -> Self {
        KeyStrategy::User(Arc::new(BearerClaims::default()))
    }

    /// Per-user strategy with a custom decoder.
    pub fn user_with<D: IdentityDecoder + 'static>(decoder: D) -> Self {
        KeyStrategy::User(Arc::new(decoder))
    }

    /// Custom scope function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RequestHead<'_>) -> String + Send + Sync + 'static,
    {
        KeyStrategy::Custom(Arc::new(f))
    }

    /// Short label for logs and config round-trips.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStrategy::Ip => "ip",
            KeyStrategy::User(_) => "user",
            KeyStrategy::Custom(_) => "custom",
        }
    }

    /// Scope for `head`, falling back to the strategy's default scope on failure.
    ///
    /// Malformed credentials are logged at warn level and evaluated as `"anonymous"`.
    pub fn scope(&self, head: &RequestHead<'_>) -> String {
        match self {
            KeyStrategy::Ip => head.client_ip().unwrap_or_else(|| UNKNOWN_SCOPE.to_string()),
            KeyStrategy::User(decoder) => {
                if let Some(user) = head.extensions.get::<AuthenticatedUser>() {
                    return user.0.clone();
                }
                match decoder.decode(head) {
                    Ok(Some(id)) => id,
                    Ok(None) => ANONYMOUS_SCOPE.to_string(),
                    Err(err) => {
                        tracing::warn!(
                            target: "turnstile::key",
                            error = %err,
                            ip = head.client_ip().as_deref().unwrap_or(UNKNOWN_SCOPE),
                            "key derivation failed; using anonymous scope"
                        );
                        ANONYMOUS_SCOPE.to_string()
                    }
                }
            }
            KeyStrategy::Custom(f) => f(head),
        }
    }

    /// Full partition key: `"{policy}:{scope}"`.
    pub fn key(&self, policy: &str, head: &RequestHead<'_>) -> String {
        format!("{policy}:{}", self.scope(head))
    }
}
