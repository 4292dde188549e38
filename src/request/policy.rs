//! Cache policy declared per request descriptor.

use std::time::Duration;

/// How a request interacts with the cache store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Never read or write the cache.
    Bypass,

    /// Serve a valid cached entry without touching the transport; on a miss
    /// fetch from the transport and store the result under the given TTL.
    CacheFirst {
        /// How long a stored entry remains valid.
        ttl: Duration,
    },

    /// Serve only from the cache; a miss is an error and the transport is
    /// never invoked.
    CacheOnly,
}

impl CachePolicy {
    /// Cache-first policy with the given TTL.
    #[must_use]
    pub fn cache_first(ttl: Duration) -> Self {
        Self::CacheFirst { ttl }
    }

    /// Cache-first policy from whole seconds. Negative input is clamped to
    /// zero (a zero TTL stores entries that are already stale on the next
    /// touch).
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn cache_first_secs(secs: i64) -> Self {
        Self::CacheFirst {
            ttl: Duration::from_secs(secs.max(0) as u64),
        }
    }

    /// True when the policy consults the cache before the transport.
    #[must_use]
    pub fn reads_cache(self) -> bool {
        matches!(self, Self::CacheFirst { .. } | Self::CacheOnly)
    }

    /// TTL under which a fresh response should be stored, when the policy
    /// writes to the cache at all.
    #[must_use]
    pub fn store_ttl(self) -> Option<Duration> {
        match self {
            Self::CacheFirst { ttl } => Some(ttl),
            Self::Bypass | Self::CacheOnly => None,
        }
    }
}
