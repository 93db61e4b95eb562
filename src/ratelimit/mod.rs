//! Rate limiting: counter stores, key generators, the fixed-window
//! strategy and the policy router.

pub mod clock;
mod key;
mod policy;
mod request;
mod router;
pub mod storage;
mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{
    client_ip, CredentialKeyGenerator, IpKeyGenerator, IpPathKeyGenerator, KeyGenerator,
    KeyGeneratorKind, DEFAULT_CREDENTIAL_HEADER, UNKNOWN_IP,
};
pub use policy::{
    MethodMatch, Policy, PolicyConfig, PolicyTable, PolicyTableConfig, RouteRule, RuleConfig,
    DEFAULT_MESSAGE, MAX_WINDOW_SECONDS,
};
pub use request::RequestInfo;
pub use router::{PolicyRouter, StorageBackends};
pub use storage::{
    CounterClient, CounterRecord, LocalStorage, RedisCounterClient, SharedStorage, Storage,
    StorageKind,
};
pub use strategy::{
    Decision, DenialBody, DenialResponse, FixedWindowStrategy, Verdict, HEADER_LIMIT,
    HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
