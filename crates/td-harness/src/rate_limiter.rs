use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use td_core::config::RateLimitsConfig;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur when enforcing rate limits.
///
/// ```rust
/// use std::time::Duration;
/// use td_harness::rate_limiter::{RateLimiter, RateLimitRule, RateLimitError};
///
/// let limiter = RateLimiter::new().with_rule("login", RateLimitRule::new(1, Duration::from_secs(60)));
/// limiter.check("login", "10.0.0.1").unwrap();
/// match limiter.check("login", "10.0.0.1") {
///     Err(RateLimitError::Exceeded { retry_after, .. }) => assert!(retry_after.as_secs() <= 60),
///     Ok(()) => unreachable!(),
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// `limit` hits are already inside the window for this namespace and key.
    #[error("rate limit exceeded for `{namespace}:{key}`, retry after {retry_after:?}")]
    Exceeded {
        namespace: String,
        key: String,
        /// Time until the oldest hit leaves the window.
        retry_after: Duration,
    },
}

impl RateLimitError {
    /// Whole seconds to advertise in `Retry-After`, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            RateLimitError::Exceeded { retry_after, .. } => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                secs.max(1)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// At most `limit` hits per sliding `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Sliding-window limiter keyed by `(namespace, key)`.
///
/// Every accepted hit is timestamped; a check first drops timestamps older
/// than the namespace window, then admits the hit only while fewer than
/// `limit` remain. Namespaces without a rule are not limited.
///
/// State lives in this process only. Several replicas each enforce their own
/// window, so the effective limit scales with the replica count.
#[derive(Debug, Default)]
pub struct RateLimiter {
    rules: HashMap<String, RateLimitRule>,
    hits: DashMap<(String, String), VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One rule per namespace from the `[rate_limits]` config section.
    pub fn from_config(config: &RateLimitsConfig) -> Self {
        config
            .rules()
            .into_iter()
            .fold(Self::new(), |limiter, (namespace, section)| {
                limiter.with_rule(
                    namespace,
                    RateLimitRule::new(section.limit, Duration::from_secs(section.window_secs)),
                )
            })
    }

    pub fn with_rule(mut self, namespace: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rules.insert(namespace.into(), rule);
        self
    }

    pub fn rule(&self, namespace: &str) -> Option<RateLimitRule> {
        self.rules.get(namespace).copied()
    }

    /// Record a hit for `key` in `namespace`, or reject it.
    pub fn check(&self, namespace: &str, key: &str) -> Result<(), RateLimitError> {
        self.check_at(namespace, key, Instant::now())
    }

    pub fn check_at(&self, namespace: &str, key: &str, now: Instant) -> Result<(), RateLimitError> {
        let Some(rule) = self.rule(namespace) else {
            return Ok(());
        };

        let mut window = self
            .hits
            .entry((namespace.to_string(), key.to_string()))
            .or_default();
        prune(&mut window, rule.window, now);

        if window.len() >= rule.limit as usize {
            let oldest = window.front().copied().unwrap_or(now);
            let retry_after = (oldest + rule.window).saturating_duration_since(now);
            warn!(namespace, key, ?retry_after, "rate limit exceeded");
            return Err(RateLimitError::Exceeded {
                namespace: namespace.to_string(),
                key: key.to_string(),
                retry_after,
            });
        }
        window.push_back(now);
        Ok(())
    }

    /// Hits still available for `key` right now. `None` for unlimited
    /// namespaces.
    pub fn remaining(&self, namespace: &str, key: &str) -> Option<u32> {
        let rule = self.rule(namespace)?;
        let now = Instant::now();
        let used = self
            .hits
            .get(&(namespace.to_string(), key.to_string()))
            .map(|w| w.iter().filter(|t| now.duration_since(**t) < rule.window).count())
            .unwrap_or(0);
        Some(rule.limit.saturating_sub(used as u32))
    }

    /// Drop expired timestamps everywhere and forget keys whose window is
    /// empty. Returns how many keys were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.hits.len();
        self.hits.retain(|(namespace, _), window| {
            match self.rules.get(namespace) {
                Some(rule) => prune(window, rule.window, now),
                None => window.clear(),
            }
            !window.is_empty()
        });
        let removed = before.saturating_sub(self.hits.len());
        if removed > 0 {
            debug!(removed, "rate limiter swept idle keys");
        }
        removed
    }

    /// Number of `(namespace, key)` pairs currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.hits.len()
    }
}

fn prune(window: &mut VecDeque<Instant>, span: Duration, now: Instant) {
    while let Some(front) = window.front() {
        if now.saturating_duration_since(*front) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}
