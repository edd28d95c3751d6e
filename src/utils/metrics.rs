use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Why the spider dropped a task or link without fetching it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Already in the visit history
    Visited,
    /// Deeper than the configured maximum depth
    Depth,
    /// Queue payload could not be decoded
    Malformed,
}

/// Crawl metrics collector, shared between a spider and its worker
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<CrawlMetrics>>,
}

/// Counters for one spider instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlMetrics {
    pub started_at: DateTime<Utc>,

    /// Pages fetched successfully
    pub pages_fetched: u64,

    pub fetch_failures: u64,

    /// Total time spent in the fetcher, in milliseconds
    pub fetch_millis: u64,

    /// Links extracted from fetched pages
    pub links_discovered: u64,

    /// Links that were new to the queue
    pub links_enqueued: u64,

    pub skipped_visited: u64,
    pub skipped_depth: u64,
    pub malformed_items: u64,

    pub last_activity: Option<DateTime<Utc>>,
}

impl CrawlMetrics {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            pages_fetched: 0,
            fetch_failures: 0,
            fetch_millis: 0,
            links_discovered: 0,
            links_enqueued: 0,
            skipped_visited: 0,
            skipped_depth: 0,
            malformed_items: 0,
            last_activity: None,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(CrawlMetrics::new())),
        }
    }

    /// Record the outcome of one fetch
    pub async fn record_fetch(&self, success: bool, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;

        if success {
            metrics.pages_fetched += 1;
        } else {
            metrics.fetch_failures += 1;
        }
        metrics.fetch_millis += duration_ms;
        metrics.last_activity = Some(Utc::now());
    }

    /// Record the links found on a page and how many of them were queued
    pub async fn record_links(&self, discovered: usize, enqueued: usize) {
        let mut metrics = self.metrics.lock().await;
        metrics.links_discovered += discovered as u64;
        metrics.links_enqueued += enqueued as u64;
    }

    pub async fn record_skip(&self, reason: SkipReason) {
        let mut metrics = self.metrics.lock().await;
        match reason {
            SkipReason::Visited => metrics.skipped_visited += 1,
            SkipReason::Depth => metrics.skipped_depth += 1,
            SkipReason::Malformed => metrics.malformed_items += 1,
        }
        metrics.last_activity = Some(Utc::now());
    }

    /// Start timing a fetch
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    pub async fn get_metrics(&self) -> CrawlMetrics {
        self.metrics.lock().await.clone()
    }

    pub async fn reset(&self) {
        *self.metrics.lock().await = CrawlMetrics::new();
    }
}

/// Request timer for measuring fetch durations
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
