//! Serializable queue and limiter settings.
//!
//! Durations are plain milliseconds so a config stays readable as JSON.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::WorkqError;
use crate::limiter::{
    BucketRateLimiter, ExponentialFailureRateLimiter, FastSlowRateLimiter, MaxOfRateLimiter, RateLimiter,
};
use crate::queue::Key;

/// Rate limiter policy.
///
/// `Default` is the controller policy: exponential backoff from 5ms up to
/// 1000s, combined with a 10 qps / 100 burst bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimiterConfig {
    TokenBucket {
        qps: f64,
        burst: u32,
    },
    Exponential {
        base_delay_ms: u64,
        max_delay_ms: u64,
    },
    FastSlow {
        fast_delay_ms: u64,
        slow_delay_ms: u64,
        max_fast_attempts: usize,
    },
    MaxOf {
        limiters: Vec<LimiterConfig>,
    },
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::MaxOf {
            limiters: vec![
                Self::Exponential {
                    base_delay_ms: 5,
                    max_delay_ms: 1_000_000,
                },
                Self::TokenBucket { qps: 10.0, burst: 100 },
            ],
        }
    }
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<(), WorkqError> {
        match self {
            Self::TokenBucket { qps, burst } => {
                if !qps.is_finite() || *qps <= 0.0 {
                    return Err(WorkqError::InvalidConfig(format!(
                        "token_bucket qps must be positive and finite, got {qps}"
                    )));
                }
                if *burst == 0 {
                    return Err(WorkqError::InvalidConfig("token_bucket burst must be at least 1".into()));
                }
            }
            Self::Exponential {
                base_delay_ms,
                max_delay_ms,
            } => {
                if base_delay_ms > max_delay_ms {
                    return Err(WorkqError::InvalidConfig(format!(
                        "exponential base_delay_ms ({base_delay_ms}) exceeds max_delay_ms ({max_delay_ms})"
                    )));
                }
            }
            Self::FastSlow {
                fast_delay_ms,
                slow_delay_ms,
                ..
            } => {
                if fast_delay_ms > slow_delay_ms {
                    return Err(WorkqError::InvalidConfig(format!(
                        "fast_slow fast_delay_ms ({fast_delay_ms}) exceeds slow_delay_ms ({slow_delay_ms})"
                    )));
                }
            }
            Self::MaxOf { limiters } => {
                if limiters.is_empty() {
                    return Err(WorkqError::InvalidConfig("max_of needs at least one limiter".into()));
                }
                for limiter in limiters {
                    limiter.validate()?;
                }
            }
        }
        Ok(())
    }

    /// Build the limiter. Token buckets read time from `clock`.
    ///
    /// Call [`validate`](Self::validate) first; an invalid policy still builds
    /// but behaves as described on the individual limiters.
    pub fn build<K: Key>(&self, clock: Arc<dyn Clock>) -> Box<dyn RateLimiter<K>> {
        match self {
            Self::TokenBucket { qps, burst } => Box::new(BucketRateLimiter::new(clock, *qps, *burst)),
            Self::Exponential {
                base_delay_ms,
                max_delay_ms,
            } => Box::new(ExponentialFailureRateLimiter::new(
                Duration::from_millis(*base_delay_ms),
                Duration::from_millis(*max_delay_ms),
            )),
            Self::FastSlow {
                fast_delay_ms,
                slow_delay_ms,
                max_fast_attempts,
            } => Box::new(FastSlowRateLimiter::new(
                Duration::from_millis(*fast_delay_ms),
                Duration::from_millis(*slow_delay_ms),
                *max_fast_attempts,
            )),
            Self::MaxOf { limiters } => Box::new(MaxOfRateLimiter::new(
                limiters.iter().map(|l| l.build::<K>(Arc::clone(&clock))).collect(),
            )),
        }
    }
}

/// Settings for a delaying / rate limiting queue. Missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Longest the scheduler sleeps without checking for ready items.
    pub heartbeat_ms: u64,

    /// Buffer between `add_after` callers and the scheduler.
    pub channel_capacity: usize,

    pub limiter: LimiterConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 10_000,
            channel_capacity: 1000,
            limiter: LimiterConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Parse and validate.
    pub fn from_json(s: &str) -> Result<Self, WorkqError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn validate(&self) -> Result<(), WorkqError> {
        if self.heartbeat_ms == 0 {
            return Err(WorkqError::InvalidConfig("heartbeat_ms must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(WorkqError::InvalidConfig("channel_capacity must be at least 1".into()));
        }
        self.limiter.validate()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use rstest::rstest;

    use super::*;
    use crate::clock::FakeClock;

    #[test]
    fn default_matches_the_controller_policy() {
        let c = QueueConfig::default();
        assert_eq!(c.heartbeat(), Duration::from_secs(10));
        assert_eq!(c.channel_capacity, 1000);
        assert!(c.validate().is_ok());

        let limiter = c.limiter.build::<&str>(Arc::new(FakeClock::new(Instant::now())));
        assert_eq!(limiter.when(&"k"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"k"), Duration::from_millis(10));
    }

    #[test]
    fn empty_json_gives_defaults() {
        let c = QueueConfig::from_json("{}").expect("parse");
        assert_eq!(c, QueueConfig::default());
    }

    #[test]
    fn parses_nested_limiters() {
        let json = r#"{
            "heartbeat_ms": 250,
            "limiter": {
                "kind": "max_of",
                "limiters": [
                    { "kind": "fast_slow", "fast_delay_ms": 5, "slow_delay_ms": 3000, "max_fast_attempts": 2 },
                    { "kind": "exponential", "base_delay_ms": 1, "max_delay_ms": 1000 }
                ]
            }
        }"#;
        let c = QueueConfig::from_json(json).expect("parse");
        assert_eq!(c.heartbeat(), Duration::from_millis(250));
        assert_eq!(c.channel_capacity, 1000);

        let limiter = c.limiter.build::<u32>(Arc::new(FakeClock::new(Instant::now())));
        assert_eq!(limiter.when(&1), Duration::from_millis(5));
        assert_eq!(limiter.when(&1), Duration::from_millis(5));
        assert_eq!(limiter.when(&1), Duration::from_secs(3));
        assert_eq!(limiter.num_requeues(&1), 3);
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = QueueConfig::from_json(r#"{ "limiter": { "kind": "nope" } }"#).unwrap_err();
        assert!(matches!(err, WorkqError::ConfigParse(_)));
    }

    #[rstest]
    #[case::zero_qps(LimiterConfig::TokenBucket { qps: 0.0, burst: 1 })]
    #[case::nan_qps(LimiterConfig::TokenBucket { qps: f64::NAN, burst: 1 })]
    #[case::infinite_qps(LimiterConfig::TokenBucket { qps: f64::INFINITY, burst: 1 })]
    #[case::zero_burst(LimiterConfig::TokenBucket { qps: 1.0, burst: 0 })]
    #[case::base_above_max(LimiterConfig::Exponential { base_delay_ms: 10, max_delay_ms: 1 })]
    #[case::fast_above_slow(LimiterConfig::FastSlow { fast_delay_ms: 10, slow_delay_ms: 1, max_fast_attempts: 1 })]
    #[case::empty_max_of(LimiterConfig::MaxOf { limiters: vec![] })]
    #[case::nested_invalid(LimiterConfig::MaxOf { limiters: vec![LimiterConfig::TokenBucket { qps: -1.0, burst: 1 }] })]
    fn invalid_limiters_are_rejected(#[case] limiter: LimiterConfig) {
        let err = limiter.validate().unwrap_err();
        assert!(matches!(err, WorkqError::InvalidConfig(_)), "{err}");
    }

    #[rstest]
    #[case::heartbeat(QueueConfig { heartbeat_ms: 0, ..QueueConfig::default() })]
    #[case::capacity(QueueConfig { channel_capacity: 0, ..QueueConfig::default() })]
    fn zero_queue_settings_are_rejected(#[case] config: QueueConfig) {
        assert!(matches!(config.validate(), Err(WorkqError::InvalidConfig(_))));
    }

    #[test]
    fn serializes_with_kind_tag() {
        let value = serde_json::to_value(LimiterConfig::TokenBucket { qps: 2.5, burst: 3 }).expect("serialize");
        assert_eq!(value, serde_json::json!({ "kind": "token_bucket", "qps": 2.5, "burst": 3 }));
    }
}
