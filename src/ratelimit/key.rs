//! Bucket key derivation.
//!
//! A key generator maps a request to the string its counter is stored
//! under. Keys are `<prefix>:<kind>:<identity>`, so two policies with
//! different prefixes never share a bucket.

use serde::{Deserialize, Serialize};

use super::request::RequestInfo;

/// Identity used when no client address can be found.
pub const UNKNOWN_IP: &str = "unknown-ip";

/// Header read by the credential generator unless a policy overrides it.
pub const DEFAULT_CREDENTIAL_HEADER: &str = "authorization";

/// Trait for deriving a rate limit bucket key from a request.
pub trait KeyGenerator: Send + Sync {
    /// Produce the bucket key. Never fails; missing metadata falls back to a
    /// coarser identity.
    fn generate_key(&self, req: &RequestInfo) -> String;
}

/// How a policy buckets its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyGeneratorKind {
    /// One bucket per client IP
    ByIp,
    /// One bucket per client IP and URL path
    ByIpAndPath,
    /// One bucket per bearer token, falling back to the client IP
    ByCredential,
}

impl KeyGeneratorKind {
    /// Build the generator for this kind.
    pub fn build(
        self,
        prefix: &str,
        credential_header: Option<&str>,
    ) -> Box<dyn KeyGenerator> {
        match self {
            KeyGeneratorKind::ByIp => Box::new(IpKeyGenerator::new(prefix)),
            KeyGeneratorKind::ByIpAndPath => Box::new(IpPathKeyGenerator::new(prefix)),
            KeyGeneratorKind::ByCredential => Box::new(CredentialKeyGenerator::new(
                prefix,
                credential_header.unwrap_or(DEFAULT_CREDENTIAL_HEADER),
            )),
        }
    }
}

/// Extract the client address.
///
/// Order: first `x-forwarded-for` entry, `x-real-ip`, the connected peer,
/// then [`UNKNOWN_IP`].
pub fn client_ip(req: &RequestInfo) -> String {
    let forwarded = req
        .header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    let real_ip = || {
        req.header("x-real-ip")
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(str::to_string)
        .or_else(|| req.peer_ip.map(|ip| ip.to_string()))
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// Keys by client IP: `<prefix>:ip:<ip>`.
#[derive(Debug, Clone)]
pub struct IpKeyGenerator {
    prefix: String,
}

impl IpKeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl KeyGenerator for IpKeyGenerator {
    fn generate_key(&self, req: &RequestInfo) -> String {
        format!("{}:ip:{}", self.prefix, client_ip(req))
    }
}

/// Keys by client IP and path: `<prefix>:ip-path:<ip>:<path>`.
#[derive(Debug, Clone)]
pub struct IpPathKeyGenerator {
    prefix: String,
}

impl IpPathKeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl KeyGenerator for IpPathKeyGenerator {
    fn generate_key(&self, req: &RequestInfo) -> String {
        format!("{}:ip-path:{}:{}", self.prefix, client_ip(req), req.path)
    }
}

/// Keys by bearer token: `<prefix>:token:<token>`.
///
/// Requests without a usable `Bearer <token>` header are keyed by IP, the
/// same as [`IpKeyGenerator`] with this prefix.
#[derive(Debug, Clone)]
pub struct CredentialKeyGenerator {
    header: String,
    fallback: IpKeyGenerator,
}

impl CredentialKeyGenerator {
    pub fn new(prefix: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            fallback: IpKeyGenerator::new(prefix),
        }
    }

    fn bearer_token<'a>(&self, req: &'a RequestInfo) -> Option<&'a str> {
        let (scheme, token) = req.header(&self.header)?.trim().split_once(' ')?;
        let token = token.trim();
        (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
    }
}

impl KeyGenerator for CredentialKeyGenerator {
    fn generate_key(&self, req: &RequestInfo) -> String {
        match self.bearer_token(req) {
            Some(token) => format!("{}:token:{}", self.fallback.prefix, token),
            None => self.fallback.generate_key(req),
        }
    }
}
