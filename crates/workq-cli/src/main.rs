use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use workq_core::{
    QueueConfig, RateLimitingQueue, RealClock, Reconciler, WorkQueue, WorkerGroup, WorkerOptions, WorkqError,
};

const MAX_FAILURES_PER_KEY: u32 = 3;

/// Fails at random, at most `MAX_FAILURES_PER_KEY` times per key.
struct CoinFlip {
    failures: Mutex<HashMap<String, u32>>,
    reconciled: Mutex<HashSet<String>>,
}

impl CoinFlip {
    fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            reconciled: Mutex::new(HashSet::new()),
        }
    }

    fn reconciled(&self) -> usize {
        self.reconciled.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Reconciler<String> for CoinFlip {
    async fn reconcile(&self, key: &String) -> Result<(), WorkqError> {
        // 処理しているふり
        let work_ms = rand::thread_rng().gen_range(1..20);
        sleep(Duration::from_millis(work_ms)).await;

        let fail = {
            let mut failures = self
                .failures
                .lock()
                .map_err(|e| WorkqError::Reconcile(e.to_string()))?;
            let count = failures.entry(key.clone()).or_insert(0);
            let fail = *count < MAX_FAILURES_PER_KEY && rand::thread_rng().gen_bool(0.5);
            if fail {
                *count += 1;
            }
            fail
        };
        if fail {
            return Err(WorkqError::Reconcile(format!("{key}: coin came up tails")));
        }

        info!(%key, "reconciled");
        self.reconciled
            .lock()
            .map_err(|e| WorkqError::Reconcile(e.to_string()))?
            .insert(key.clone());
        Ok(())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn load_config() -> Result<QueueConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            info!(%path, "loaded queue config");
            Ok(QueueConfig::from_json(&raw)?)
        }
        None => Ok(QueueConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    // (A) Queue と Reconciler を用意
    let config = load_config()?;
    let queue = Arc::new(RateLimitingQueue::<String>::from_config(Arc::new(RealClock), &config)?);
    let reconciler = Arc::new(CoinFlip::new());

    // (B) worker を起動
    let options = WorkerOptions { max_retries: None };
    let group = WorkerGroup::spawn(4, queue.clone(), reconciler.clone(), options);

    // (C) key を投入（重複あり、重複分はまとめられる）
    let keys = ["alpha", "beta", "gamma", "alpha", "delta", "beta", "epsilon"];
    let distinct: HashSet<_> = keys.iter().collect();
    for key in keys {
        queue.add(key.to_string());
    }
    info!(added = keys.len(), distinct = distinct.len(), "keys enqueued");

    // (D) 全 key が成功するまでポーリング
    while reconciler.reconciled() < distinct.len() {
        sleep(Duration::from_millis(20)).await;
    }

    // (E) drain して止める
    group.drain_and_join().await?;
    println!("{}", serde_json::to_string_pretty(&queue.stats())?);
    Ok(())
}
