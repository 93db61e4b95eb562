//! Rate limit policies and the route table that selects them.
//!
//! Policies are read once at startup, either from YAML or from the built-in
//! marketplace table, and shared read-only afterwards.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::Method;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::key::KeyGeneratorKind;
use super::request::RequestInfo;
use super::storage::StorageKind;
use crate::error::{GuardError, Result};

/// Message returned to throttled clients when a policy sets none.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Longest accepted window: one year.
pub const MAX_WINDOW_SECONDS: u64 = 365 * 24 * 60 * 60;

/// A resolved, immutable rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    /// Unique name; also the identity strategies are cached under
    pub name: String,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Hits allowed per window
    pub max_requests: u64,
    /// How clients are bucketed
    pub key_generator: KeyGeneratorKind,
    /// Which counter store holds the buckets
    pub storage: StorageKind,
    /// Prefix for every bucket key of this policy
    pub key_prefix: String,
    /// Human-readable denial message
    pub message: String,
    /// Header carrying the bearer credential, for `by-credential`
    pub credential_header: Option<String>,
}

/// Which HTTP methods a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MethodMatch {
    /// Every method
    #[default]
    Any,
    /// A single method
    Only(Method),
}

impl MethodMatch {
    pub fn matches(&self, method: &Method) -> bool {
        match self {
            MethodMatch::Any => true,
            MethodMatch::Only(m) => m == method,
        }
    }
}

impl FromStr for MethodMatch {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "*" || s.eq_ignore_ascii_case("any") {
            return Ok(MethodMatch::Any);
        }
        Method::from_bytes(s.to_ascii_uppercase().as_bytes())
            .map(MethodMatch::Only)
            .map_err(|_| GuardError::config(format!("Invalid HTTP method: {:?}", s)))
    }
}

impl TryFrom<String> for MethodMatch {
    type Error = GuardError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MethodMatch> for String {
    fn from(m: MethodMatch) -> Self {
        m.to_string()
    }
}

impl fmt::Display for MethodMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodMatch::Any => write!(f, "ANY"),
            MethodMatch::Only(m) => write!(f, "{}", m),
        }
    }
}

/// A path pattern and method paired with the policy they select.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub pattern: Regex,
    pub method: MethodMatch,
    pub policy: Arc<Policy>,
}

impl RouteRule {
    /// Whether this rule applies to `req`.
    pub fn matches(&self, req: &RequestInfo) -> bool {
        self.method.matches(&req.method) && self.pattern.is_match(&req.path)
    }
}

/// The resolved route table.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    /// Only paths under this prefix are limited
    pub protected_prefix: String,
    /// Paths under these prefixes are never limited
    pub exempt_prefixes: Vec<String>,
    /// Ordered rules; first match wins
    pub rules: Vec<RouteRule>,
    /// Policy applied when no rule matches
    pub default: Arc<Policy>,
}

impl PolicyTable {
    /// The built-in marketplace table, with every policy on `storage`.
    pub fn marketplace(storage: StorageKind) -> Result<Self> {
        PolicyTableConfig::marketplace().resolve(storage)
    }

    /// Whether `path` is outside rate limiting altogether.
    pub fn is_exempt(&self, path: &str) -> bool {
        !under_prefix(path, &self.protected_prefix)
            || self.exempt_prefixes.iter().any(|p| under_prefix(path, p))
    }

    /// Every policy in the table, default last.
    pub fn policies(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.rules
            .iter()
            .map(|r| &r.policy)
            .chain(std::iter::once(&self.default))
    }
}

/// `/api/auth/` covers `/api/auth`, `/api/auth/` and `/api/auth/callback`.
fn under_prefix(path: &str, prefix: &str) -> bool {
    let bare = prefix.trim_end_matches('/');
    if bare.is_empty() {
        return true;
    }
    match path.strip_prefix(bare) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Policy as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    pub window_seconds: u64,
    pub max_requests: u64,
    #[serde(default = "default_key_generator")]
    pub key_generator: KeyGeneratorKind,
    /// Inherits the deployment's storage when omitted
    #[serde(default)]
    pub storage: Option<StorageKind>,
    /// Defaults to `rl:<name>`
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub credential_header: Option<String>,
}

fn default_key_generator() -> KeyGeneratorKind {
    KeyGeneratorKind::ByIp
}

impl PolicyConfig {
    fn new(name: &str, window_seconds: u64, max_requests: u64, key: KeyGeneratorKind) -> Self {
        Self {
            name: name.to_string(),
            window_seconds,
            max_requests,
            key_generator: key,
            storage: None,
            key_prefix: None,
            message: None,
            credential_header: None,
        }
    }

    fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    /// Validate and fill in defaults.
    pub fn resolve(self, default_storage: StorageKind) -> Result<Policy> {
        if self.name.trim().is_empty() {
            return Err(GuardError::config("Policy name must not be empty"));
        }
        if self.window_seconds == 0 || self.window_seconds > MAX_WINDOW_SECONDS {
            return Err(GuardError::config(format!(
                "Policy {:?}: window_seconds must be between 1 and {}",
                self.name, MAX_WINDOW_SECONDS
            )));
        }
        if self.max_requests == 0 {
            return Err(GuardError::config(format!(
                "Policy {:?}: max_requests must be greater than 0",
                self.name
            )));
        }

        Ok(Policy {
            key_prefix: self.key_prefix.unwrap_or_else(|| format!("rl:{}", self.name)),
            message: self.message.unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            storage: self.storage.unwrap_or(default_storage),
            name: self.name,
            window_seconds: self.window_seconds,
            max_requests: self.max_requests,
            key_generator: self.key_generator,
            credential_header: self.credential_header,
        })
    }
}

/// Route rule as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Regular expression matched against the request path
    pub path: String,
    #[serde(default)]
    pub method: MethodMatch,
    pub policy: PolicyConfig,
}

/// Route table as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTableConfig {
    #[serde(default = "default_protected_prefix")]
    pub protected_prefix: String,
    #[serde(default = "default_exempt_prefixes")]
    pub exempt_prefixes: Vec<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default = "default_policy")]
    pub default: PolicyConfig,
}

fn default_protected_prefix() -> String {
    "/api/".to_string()
}

fn default_exempt_prefixes() -> Vec<String> {
    vec!["/api/auth/".to_string(), "/api/health".to_string()]
}

fn default_policy() -> PolicyConfig {
    PolicyConfig::new("default", 60, 30, KeyGeneratorKind::ByIp)
}

impl Default for PolicyTableConfig {
    fn default() -> Self {
        Self::marketplace()
    }
}

impl PolicyTableConfig {
    /// Limits for the NFT marketplace API.
    pub fn marketplace() -> Self {
        Self {
            protected_prefix: default_protected_prefix(),
            exempt_prefixes: default_exempt_prefixes(),
            rules: vec![
                RuleConfig {
                    path: r"^/api/digimons/mint/?$".to_string(),
                    method: MethodMatch::Only(Method::POST),
                    policy: PolicyConfig::new("mint", 60, 5, KeyGeneratorKind::ByIp)
                        .with_message("Too many mint requests, please slow down."),
                },
                RuleConfig {
                    path: r"^/api/marketplace/(buy|sell|list|cancel|offer)(/.*)?$".to_string(),
                    method: MethodMatch::Only(Method::POST),
                    policy: PolicyConfig::new(
                        "marketplace",
                        60,
                        10,
                        KeyGeneratorKind::ByCredential,
                    )
                    .with_message("Too many marketplace transactions, please slow down."),
                },
                RuleConfig {
                    path: r"^/api/".to_string(),
                    method: MethodMatch::Only(Method::GET),
                    policy: PolicyConfig::new("read", 60, 100, KeyGeneratorKind::ByIpAndPath),
                },
            ],
            default: default_policy(),
        }
    }

    /// Compile patterns, validate policies and fill in defaults.
    pub fn resolve(self, default_storage: StorageKind) -> Result<PolicyTable> {
        let mut names = HashSet::new();
        let mut check_name = |name: &str| {
            if names.insert(name.to_string()) {
                Ok(())
            } else {
                Err(GuardError::config(format!("Duplicate policy name {:?}", name)))
            }
        };

        let mut rules = Vec::with_capacity(self.rules.len());
        for rule in self.rules {
            let pattern = Regex::new(&rule.path).map_err(|e| {
                GuardError::config(format!("Invalid path pattern {:?}: {}", rule.path, e))
            })?;
            check_name(&rule.policy.name)?;
            rules.push(RouteRule {
                pattern,
                method: rule.method,
                policy: Arc::new(rule.policy.resolve(default_storage)?),
            });
        }

        check_name(&self.default.name)?;
        let default = Arc::new(self.default.resolve(default_storage)?);

        Ok(PolicyTable {
            protected_prefix: self.protected_prefix,
            exempt_prefixes: self.exempt_prefixes,
            rules,
            default,
        })
    }
}
