use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::CacheError;

/// Selects how the scope of a cached value is derived.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// One scope shared by everyone.
    #[default]
    Global,
    /// One scope per session.
    Session,
    /// One scope per user.
    User,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Global => "global",
            CacheType::Session => "session",
            CacheType::User => "user",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`CacheType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cache type `{0}`, expected one of `global`, `session` or `user`")]
pub struct ParseCacheTypeError(String);

impl FromStr for CacheType {
    type Err = ParseCacheTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(CacheType::Global),
            "session" => Ok(CacheType::Session),
            "user" => Ok(CacheType::User),
            other => Err(ParseCacheTypeError(other.to_owned())),
        }
    }
}

/// The eviction strategy of a [`CachePolicy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PolicyKind {
    /// Never evict anything.
    KeepAll,
    /// Keep at most `max_size` unpinned values, evicting the least recently used one.
    Lru { max_size: NonZeroUsize },
    /// Evict values `ttl` after they were last set, unless pinned.
    Ttl {
        #[serde(with = "humantime_serde")]
        ttl: Duration,
    },
}

/// The cache policy attached to a [`RegistryEntry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(flatten)]
    pub kind: PolicyKind,
    #[serde(default)]
    pub cache_type: CacheType,
}

impl CachePolicy {
    pub fn keep_all() -> Self {
        Self::new(PolicyKind::KeepAll)
    }

    pub fn lru(max_size: NonZeroUsize) -> Self {
        Self::new(PolicyKind::Lru { max_size })
    }

    /// Only keeps the most recently set value, an [`lru`](Self::lru) policy of size 1.
    pub fn most_recent() -> Self {
        Self::lru(NonZeroUsize::MIN)
    }

    pub fn ttl(ttl: Duration) -> Self {
        Self::new(PolicyKind::Ttl { ttl })
    }

    pub fn with_cache_type(mut self, cache_type: CacheType) -> Self {
        self.cache_type = cache_type;
        self
    }

    fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            cache_type: CacheType::Global,
        }
    }
}

/// The identity of whoever accesses the cache, used to resolve session and user scopes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

impl Identity {
    /// An identity without session or user, which can only access global caches.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// The partition of a cache a value lives in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheScope {
    Global,
    Session(String),
    User(String),
}

impl CacheScope {
    /// Derives the scope of a `cache_type` cache for the given identity.
    pub fn resolve(cache_type: CacheType, identity: &Identity) -> Result<Self, CacheError> {
        match cache_type {
            CacheType::Global => Ok(CacheScope::Global),
            CacheType::Session => identity
                .session_id
                .clone()
                .map(CacheScope::Session)
                .ok_or(CacheError::MissingScope(cache_type)),
            CacheType::User => identity
                .user_id
                .clone()
                .map(CacheScope::User)
                .ok_or(CacheError::MissingScope(cache_type)),
        }
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheScope::Global => f.write_str("global"),
            CacheScope::Session(id) => write!(f, "session:{id}"),
            CacheScope::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// The owner of a set of cached values, such as a derived variable.
///
/// The `uid` identifies the owner within a [`CacheStore`](super::CacheStore), and the policy is
/// fixed once the entry is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEntry {
    uid: String,
    cache: Option<CachePolicy>,
}

impl RegistryEntry {
    pub fn new(uid: impl Into<String>, cache: Option<CachePolicy>) -> Self {
        Self {
            uid: uid.into(),
            cache,
        }
    }

    /// Creates an entry with a cache policy attached.
    pub fn cached(uid: impl Into<String>, policy: CachePolicy) -> Self {
        Self::new(uid, Some(policy))
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn cache(&self) -> Option<&CachePolicy> {
        self.cache.as_ref()
    }

    /// Returns the attached policy, or an error if there is none.
    pub fn policy(&self) -> Result<&CachePolicy, CacheError> {
        self.cache
            .as_ref()
            .ok_or_else(|| CacheError::MissingPolicy(self.uid.clone()))
    }

    /// Resolves the scope the given identity accesses within this entry.
    ///
    /// Entries without a policy are treated as global.
    pub fn scope(&self, identity: &Identity) -> Result<CacheScope, CacheError> {
        let cache_type = self.cache.map(|policy| policy.cache_type).unwrap_or_default();
        CacheScope::resolve(cache_type, identity)
    }
}
