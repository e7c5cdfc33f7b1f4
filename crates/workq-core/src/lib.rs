//! workq-core
//!
//! Deduplicating work queue with delayed and rate limited requeues.
//!
//! # モジュール構成
//! - **queue**: BaseQueue（重複排除 FIFO）, DelayingQueue（add_after + scheduler thread）, RateLimitingQueue
//! - **limiter**: RateLimiter trait と実装（token bucket, exponential, fast/slow, max-of）
//! - **clock**: 時刻の抽象化（RealClock / テスト用 FakeClock）
//! - **config**: serde で読める queue / limiter 設定
//! - **worker**: tokio 上の WorkerGroup（get → reconcile → forget / requeue → done）
//! - **error**: エラー型

pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod queue;
pub mod worker;

pub use clock::{Clock, FakeClock, RealClock};
pub use config::{LimiterConfig, QueueConfig};
pub use error::WorkqError;
pub use limiter::RateLimiter;
pub use queue::{
    BaseQueue, DelayingQueue, DelayingWorkQueue, Key, QueueStats, RateLimitingQueue, RateLimitingWorkQueue,
    WorkQueue,
};
pub use worker::{Reconciler, WorkerGroup, WorkerOptions};
