use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::crawler::rules::{RuleError, RulePattern, RuleSet};
use crate::crawler::task::CrawlTask;
use crate::fetch::{dedup, extract_links, resolve_absolute, FetchOptions, PageFetcher};
use crate::storage::{DurableQueue, HistoryError, ItemStatus, QueueError, QueueStats, VisitHistory};
use crate::utils::metrics::{CrawlMetrics, MetricsCollector, SkipReason};

/// Called with `(url, html)` for every fetched page whose URL matches the callback's rule
pub type VisitCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Returns `true` for URLs that must not be queued
pub type VisitedCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Error, Debug)]
pub enum SpiderError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("spider '{0}' has exited")]
    Exited(String),

    #[error("a spider needs a name and a seed URL")]
    MissingIdentity,
}

/// Lifecycle of a spider.
///
/// `Pending -> Processing -> Suspended | Exiting`; `Suspended -> Processing` on
/// `run`. `Exiting` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiderState {
    Pending,
    Processing,
    Suspended,
    Exiting,
}

impl fmt::Display for SpiderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpiderState::Pending => "pending",
            SpiderState::Processing => "processing",
            SpiderState::Suspended => "suspended",
            SpiderState::Exiting => "exiting",
        };
        f.write_str(name)
    }
}

/// Runtime settings of a spider
#[derive(Debug, Clone, PartialEq)]
pub struct SpiderSettings {
    /// Directory holding `<name>.queue.redb` and `<name>.history.redb`
    pub data_dir: PathBuf,

    /// Maximum crawl depth, 0 for unbounded
    pub max_depth: u32,

    /// Sleep before every fetch
    pub politeness_delay: Duration,

    /// Sleep between polls of an empty queue
    pub idle_interval: Duration,

    /// Empty-queue polls before the spider exits
    pub idle_retries: u32,
}

impl Default for SpiderSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("queuedata"),
            max_depth: 0,
            politeness_delay: Duration::from_secs(1),
            idle_interval: Duration::from_secs(5),
            idle_retries: 3,
        }
    }
}

/// Rules, callbacks and fetch settings; may change while the spider runs
struct CrawlPlan {
    max_depth: u32,
    politeness_delay: Duration,
    idle_interval: Duration,
    idle_retries: u32,
    fetch_options: FetchOptions,
    url_rules: RuleSet,
    visit_handlers: Vec<(RulePattern, VisitCallback)>,
    visited_callbacks: Vec<VisitedCallback>,
}

/// State shared between a [`Spider`] and its worker task
struct SpiderCore {
    name: String,
    queue: DurableQueue,
    history: VisitHistory,
    fetcher: Arc<dyn PageFetcher>,
    plan: RwLock<CrawlPlan>,
    state: watch::Sender<SpiderState>,
    run_count: AtomicU64,
    metrics: MetricsCollector,
}

/// Resumable breadth-first crawler.
///
/// The frontier lives in a [`DurableQueue`] and processed URLs in a
/// [`VisitHistory`], both under the spider's data directory, so a new spider
/// with the same name picks up where a previous one stopped.
pub struct Spider {
    seed_url: String,
    core: Arc<SpiderCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Spider {
    /// Open (or reopen) the persisted state of spider `name`
    pub async fn open(
        name: &str,
        seed_url: &str,
        settings: SpiderSettings,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Result<Self, SpiderError> {
        if name.is_empty() || seed_url.is_empty() {
            return Err(SpiderError::MissingIdentity);
        }

        let queue = DurableQueue::open(name, &settings.data_dir).await?;
        let history = VisitHistory::open(name, &settings.data_dir).await?;
        let (state, _) = watch::channel(SpiderState::Pending);

        let plan = CrawlPlan {
            max_depth: settings.max_depth,
            politeness_delay: settings.politeness_delay,
            idle_interval: settings.idle_interval,
            idle_retries: settings.idle_retries,
            fetch_options: FetchOptions::default(),
            url_rules: RuleSet::new(),
            visit_handlers: Vec::new(),
            visited_callbacks: Vec::new(),
        };

        Ok(Self {
            seed_url: seed_url.to_string(),
            core: Arc::new(SpiderCore {
                name: name.to_string(),
                queue,
                history,
                fetcher,
                plan: RwLock::new(plan),
                state,
                run_count: AtomicU64::new(0),
                metrics: MetricsCollector::new(),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn seed_url(&self) -> &str {
        &self.seed_url
    }

    /// Replace every fetch setting at once
    pub fn fetch_options(&self, options: FetchOptions) -> &Self {
        self.core.plan_mut().fetch_options = options;
        self
    }

    /// Charset used to decode fetched pages
    pub fn charset(&self, charset: &str) -> &Self {
        self.core.plan_mut().fetch_options.charset = Some(charset.to_string());
        self
    }

    pub fn proxy(&self, proxy: &str) -> &Self {
        self.core.plan_mut().fetch_options.proxy = Some(proxy.to_string());
        self
    }

    pub fn add_header(&self, name: &str, value: &str) -> &Self {
        self.core
            .plan_mut()
            .fetch_options
            .headers
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn user_agent(&self, user_agent: &str) -> &Self {
        self.core.plan_mut().fetch_options.user_agent = Some(user_agent.to_string());
        self
    }

    pub fn timeout(&self, timeout: Duration) -> &Self {
        self.core.plan_mut().fetch_options.timeout = Some(timeout);
        self
    }

    /// Maximum crawl depth, 0 for unbounded
    pub fn depth(&self, max_depth: u32) -> &Self {
        self.core.plan_mut().max_depth = max_depth;
        self
    }

    /// Allow discovered URLs matching `rule` into the queue
    pub fn add_url_rule(&self, rule: &str) -> Result<&Self, SpiderError> {
        self.core.plan_mut().url_rules.add(rule)?;
        Ok(self)
    }

    pub fn url_rules<I, S>(&self, rules: I) -> Result<&Self, SpiderError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for rule in rules {
            self.add_url_rule(rule.as_ref())?;
        }
        Ok(self)
    }

    /// Call `callback` for every fetched page whose URL matches `rule`.
    /// Callbacks run in registration order.
    pub fn on_visit<F>(&self, rule: &str, callback: F) -> Result<&Self, SpiderError>
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let pattern = RulePattern::new(rule)?;
        self.core
            .plan_mut()
            .visit_handlers
            .push((pattern, Arc::new(callback)));
        Ok(self)
    }

    /// Skip discovered URLs for which `predicate` returns `true`
    pub fn on_visited<F>(&self, predicate: F) -> &Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.core.plan_mut().visited_callbacks.push(Arc::new(predicate));
        self
    }

    /// Start crawling, or resume a suspended spider. No-op while processing.
    ///
    /// The crawl itself runs on a background task; use [`Spider::wait`] to
    /// observe completion.
    pub async fn run(&self) -> Result<(), SpiderError> {
        let mut worker = self.worker.lock().await;

        match self.state() {
            SpiderState::Processing => return Ok(()),
            SpiderState::Exiting => return Err(SpiderError::Exited(self.core.name.clone())),
            SpiderState::Suspended => {
                if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
                    self.core.state.send_replace(SpiderState::Processing);
                    info!("Spider '{}' resumed", self.core.name);
                    return Ok(());
                }
            }
            SpiderState::Pending => {}
        }

        if self.core.queue.depth().await? == 0 {
            let seed = CrawlTask::seed(self.seed_url.as_str());
            if self.core.queue.put(&seed.encode()).await? {
                info!("Spider '{}' seeded with {}", self.core.name, self.seed_url);
            }
        }

        self.core.state.send_replace(SpiderState::Processing);
        let core = self.core.clone();
        *worker = Some(tokio::spawn(core.work()));

        info!("Spider '{}' started", self.core.name);
        Ok(())
    }

    /// Suspend after the in-flight item. Queue and history are kept; `run` resumes.
    pub fn stop(&self) {
        let suspended = self.core.state.send_if_modified(|state| {
            if *state == SpiderState::Processing {
                *state = SpiderState::Suspended;
                true
            } else {
                false
            }
        });

        if suspended {
            info!("Spider '{}' suspending", self.core.name);
        }
    }

    /// Resolves once the spider reaches `Exiting`
    pub async fn wait(&self) {
        let mut state = self.core.state.subscribe();
        // the sender lives in `core`, which outlives this borrow
        let _ = state.wait_for(|state| *state == SpiderState::Exiting).await;
    }

    /// Stop the worker and release the stores, keeping them on disk for a later run
    pub async fn shutdown(&self) -> Result<(), SpiderError> {
        self.finish(false).await
    }

    /// Stop the worker, then drain the crawl: the queue and history files are deleted
    pub async fn close(&self) -> Result<(), SpiderError> {
        self.finish(true).await
    }

    async fn finish(&self, purge: bool) -> Result<(), SpiderError> {
        let mut worker = self.worker.lock().await;
        if self.core.queue.is_closed().await {
            return Err(SpiderError::Exited(self.core.name.clone()));
        }

        self.core.state.send_replace(SpiderState::Exiting);
        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                error!("Spider '{}' worker panicked: {}", self.core.name, e);
            }
        }

        if purge {
            self.core.queue.delete().await?;
            self.core.history.delete().await?;
            info!("Spider '{}' closed and purged", self.core.name);
        } else {
            self.core.queue.close().await?;
            self.core.history.close().await?;
            info!("Spider '{}' shut down", self.core.name);
        }

        Ok(())
    }

    pub fn state(&self) -> SpiderState {
        *self.core.state.borrow()
    }

    /// Queue items the worker has consumed
    pub fn run_count(&self) -> u64 {
        self.core.run_count.load(Ordering::SeqCst)
    }

    /// Pending frontier size
    pub async fn size(&self) -> Result<u64, SpiderError> {
        Ok(self.core.queue.depth().await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, SpiderError> {
        Ok(self.core.queue.stats().await?)
    }

    pub async fn metrics(&self) -> CrawlMetrics {
        self.core.metrics.get_metrics().await
    }
}

impl SpiderCore {
    fn plan(&self) -> RwLockReadGuard<'_, CrawlPlan> {
        self.plan.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn plan_mut(&self) -> RwLockWriteGuard<'_, CrawlPlan> {
        self.plan.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker loop. The state is only checked between items, so `stop` and
    /// `close` wait for the current fetch and sleep to finish.
    async fn work(self: Arc<Self>) {
        let mut state = self.state.subscribe();
        let mut idle_polls = 0;

        loop {
            let current = *state.borrow_and_update();
            match current {
                SpiderState::Exiting => break,
                SpiderState::Suspended => {
                    info!("Spider '{}' suspended", self.name);
                    if state
                        .wait_for(|state| *state != SpiderState::Suspended)
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
                SpiderState::Pending | SpiderState::Processing => {}
            }

            let depth = match self.queue.depth().await {
                Ok(depth) => depth,
                Err(e) => {
                    error!("Spider '{}' lost its queue: {}", self.name, e);
                    self.state.send_replace(SpiderState::Exiting);
                    break;
                }
            };

            if depth == 0 {
                let (idle_retries, idle_interval) = {
                    let plan = self.plan();
                    (plan.idle_retries, plan.idle_interval)
                };

                if idle_polls < idle_retries {
                    idle_polls += 1;
                    debug!(
                        "Spider '{}' queue empty, idle poll {}/{}",
                        self.name, idle_polls, idle_retries
                    );
                    tokio::time::sleep(idle_interval).await;
                    continue;
                }

                info!(
                    "Spider '{}' finished after {} idle polls ({} items processed)",
                    self.name,
                    idle_polls,
                    self.run_count.load(Ordering::SeqCst)
                );
                self.state.send_if_modified(|state| {
                    if *state == SpiderState::Processing {
                        *state = SpiderState::Exiting;
                        true
                    } else {
                        false
                    }
                });
                continue;
            }

            idle_polls = 0;
            match self.process_next().await {
                Ok(()) => {}
                Err(e @ (SpiderError::Queue(_) | SpiderError::History(_))) => {
                    error!("Spider '{}' stopping on storage error: {}", self.name, e);
                    self.state.send_replace(SpiderState::Exiting);
                    break;
                }
                Err(e) => error!("Spider '{}' run error: {}", self.name, e),
            }
        }

        debug!("Spider '{}' worker exited", self.name);
    }

    /// Take one task off the queue and crawl it
    async fn process_next(&self) -> Result<(), SpiderError> {
        let Some(payload) = self.queue.get().await? else {
            return Ok(());
        };
        self.run_count.fetch_add(1, Ordering::SeqCst);

        let task = match CrawlTask::decode(&payload) {
            Ok(task) => task,
            Err(e) => {
                warn!("Spider '{}' skipping malformed queue item: {}", self.name, e);
                self.metrics.record_skip(SkipReason::Malformed).await;
                self.queue
                    .reply(&payload, ItemStatus::Invalid, &e.to_string())
                    .await?;
                return Ok(());
            }
        };

        let (max_depth, politeness_delay, fetch_options) = {
            let plan = self.plan();
            (plan.max_depth, plan.politeness_delay, plan.fetch_options.clone())
        };

        if max_depth > 0 && task.depth > max_depth {
            debug!(
                "Spider '{}' dropping {} at depth {} (max {})",
                self.name, task.url, task.depth, max_depth
            );
            self.metrics.record_skip(SkipReason::Depth).await;
            self.queue
                .reply(&payload, ItemStatus::Acknowledged, "beyond max depth")
                .await?;
            return Ok(());
        }

        if !self.history.record(&task.url).await? {
            debug!("Spider '{}' already visited {}", self.name, task.url);
            self.metrics.record_skip(SkipReason::Visited).await;
            self.queue
                .reply(&payload, ItemStatus::Acknowledged, "already visited")
                .await?;
            return Ok(());
        }

        tokio::time::sleep(politeness_delay).await;

        let timer = self.metrics.start_timer();
        let html = match self.fetcher.fetch_page(&task.url, &fetch_options).await {
            Ok(html) => {
                self.metrics.record_fetch(true, timer.end()).await;
                html
            }
            Err(e) => {
                warn!("Spider '{}' failed to fetch {}: {}", self.name, task.url, e);
                self.metrics.record_fetch(false, timer.end()).await;
                self.queue
                    .reply(&payload, ItemStatus::Invalid, &e.to_string())
                    .await?;
                return Ok(());
            }
        };

        self.dispatch(&task.url, &html);

        let enqueued = self.enqueue_links(&task, &html, max_depth).await?;
        debug!(
            "Spider '{}' crawled {} (depth {}), {} new links",
            self.name, task.url, task.depth, enqueued
        );

        self.queue.reply(&payload, ItemStatus::Acknowledged, "").await?;
        Ok(())
    }

    /// Run every visit callback whose rule matches `url`
    fn dispatch(&self, url: &str, html: &str) {
        let handlers: Vec<VisitCallback> = self
            .plan()
            .visit_handlers
            .iter()
            .filter(|(pattern, _)| pattern.is_match(url))
            .map(|(_, callback)| callback.clone())
            .collect();

        for handler in handlers {
            handler(url, html);
        }
    }

    /// Queue the unvisited links of a page that pass the URL rules.
    /// Returns how many were new to the queue.
    async fn enqueue_links(
        &self,
        task: &CrawlTask,
        html: &str,
        max_depth: u32,
    ) -> Result<usize, SpiderError> {
        // children stop one layer past the bound
        if max_depth > 0 && task.depth > max_depth {
            return Ok(0);
        }

        let links = match extract_links(html) {
            Ok(links) => links,
            Err(e) => {
                warn!("Spider '{}' could not read links of {}: {}", self.name, task.url, e);
                return Ok(0);
            }
        };
        let discovered = links.len();

        let visited_callbacks = self.plan().visited_callbacks.clone();
        let mut candidates = Vec::with_capacity(links.len());
        for link in links {
            let absolute = match resolve_absolute(&link, &task.url) {
                Ok(absolute) => absolute,
                Err(e) => {
                    debug!("Spider '{}' dropping link '{}': {}", self.name, link, e);
                    continue;
                }
            };

            if visited_callbacks.iter().any(|visited| visited(&absolute)) {
                continue;
            }
            if self.history.contains(&absolute).await? {
                continue;
            }
            candidates.push(absolute);
        }
        dedup(&mut candidates);

        let url_rules = self.plan().url_rules.clone();
        let mut enqueued = 0;
        for url in candidates {
            if !url_rules.allows(&url) {
                continue;
            }
            if self.queue.put(&task.child(url).encode()).await? {
                enqueued += 1;
            }
        }

        self.metrics.record_links(discovered, enqueued).await;
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchError, MockPageFetcher};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Serves canned pages and records the order of fetches
    #[derive(Default)]
    struct ScriptedFetcher {
        pages: HashMap<String, String>,
        fetched: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn with_pages(pages: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                pages: pages
                    .iter()
                    .map(|(url, html)| (url.to_string(), html.to_string()))
                    .collect(),
                fetched: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&self, url: &str, _options: &FetchOptions) -> Result<String, FetchError> {
            self.fetched.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::Other(format!("no page for {}", url)))
        }
    }

    fn links(urls: &[&str]) -> String {
        urls.iter()
            .map(|url| format!("<a href=\"{}\">link</a>", url))
            .collect()
    }

    fn settings(dir: &TempDir) -> SpiderSettings {
        SpiderSettings {
            data_dir: dir.path().to_path_buf(),
            max_depth: 0,
            politeness_delay: Duration::from_secs(1),
            idle_interval: Duration::from_secs(5),
            idle_retries: 3,
        }
    }

    async fn payloads(spider: &Spider) -> Vec<String> {
        spider
            .core
            .queue
            .find(0, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|item| String::from_utf8(item.payload).unwrap())
            .collect()
    }

    async fn seed(spider: &Spider) {
        let seed = CrawlTask::seed(spider.seed_url());
        spider.core.queue.put(&seed.encode()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_page_enqueues_matching_children() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[("http://a", links(&["http://a/1", "http://b"]).as_str())]);
        let mut settings = settings(&dir);
        settings.max_depth = 2;

        let spider = Spider::open("site", "http://a", settings, fetcher.clone()).await.unwrap();
        spider.add_url_rule("http://a/*").unwrap();
        seed(&spider).await;

        spider.core.process_next().await.unwrap();

        assert_eq!(spider.size().await.unwrap(), 1);
        assert_eq!(spider.queue_stats().await.unwrap().size, 2);
        assert_eq!(payloads(&spider).await, vec!["1@@http://a", "2@@http://a/1"]);
        assert_eq!(fetcher.fetched(), vec!["http://a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_matching_several_rules_is_queued_once() {
        let dir = TempDir::new().unwrap();
        let page = links(&["http://a/1", "/1", "http://a/1#top", "http://a/x"]);
        let fetcher = ScriptedFetcher::with_pages(&[("http://a/", page.as_str())]);

        let spider = Spider::open("site", "http://a/", settings(&dir), fetcher).await.unwrap();
        spider
            .url_rules(["http://a/*", "http://a/{digits}"])
            .unwrap();
        seed(&spider).await;

        spider.core.process_next().await.unwrap();

        assert_eq!(
            payloads(&spider).await,
            vec!["1@@http://a/", "2@@http://a/1", "2@@http://a/1#top", "2@@http://a/x"]
        );
        let metrics = spider.metrics().await;
        assert_eq!(metrics.links_discovered, 4);
        assert_eq!(metrics.links_enqueued, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_links_without_matching_rule_are_dropped() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[("http://a", links(&["http://a/1"]).as_str())]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher).await.unwrap();
        seed(&spider).await;
        spider.core.process_next().await.unwrap();

        assert_eq!(spider.queue_stats().await.unwrap().size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visited_urls_are_not_requeued() {
        let dir = TempDir::new().unwrap();
        let fetcher =
            ScriptedFetcher::with_pages(&[("http://a", links(&["http://a/1", "http://a/2", "http://a/3"]).as_str())]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher).await.unwrap();
        spider.add_url_rule("http://a/*").unwrap();
        spider.on_visited(|url| url.ends_with("/3"));
        spider.core.history.record("http://a/1").await.unwrap();
        seed(&spider).await;

        spider.core.process_next().await.unwrap();

        assert_eq!(payloads(&spider).await, vec!["1@@http://a", "2@@http://a/2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visit_callbacks_match_exactly() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[
            ("http://a", links(&["http://a/7"]).as_str()),
            ("http://a/7", "<p>post</p>"),
        ]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher).await.unwrap();
        spider.add_url_rule("http://a/*").unwrap();

        let posts = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = posts.clone();
        spider
            .on_visit("http://a/{digits}", move |url, html| {
                seen.lock().unwrap().push((url.to_string(), html.to_string()));
            })
            .unwrap();
        let pages = Arc::new(AtomicU64::new(0));
        let counter = pages.clone();
        spider
            .on_visit("HTTP://A{content}", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        seed(&spider).await;

        spider.core.process_next().await.unwrap();
        spider.core.process_next().await.unwrap();

        assert_eq!(
            *posts.lock().unwrap(),
            vec![("http://a/7".to_string(), "<p>post</p>".to_string())]
        );
        assert_eq!(pages.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_depth_bound_stops_one_layer_past_max() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[
            ("http://a", links(&["http://a/1"]).as_str()),
            ("http://a/1", links(&["http://a/1/x"]).as_str()),
        ]);
        let mut settings = settings(&dir);
        settings.max_depth = 1;

        let spider = Spider::open("site", "http://a", settings, fetcher.clone()).await.unwrap();
        spider.add_url_rule("http://a/*").unwrap();
        seed(&spider).await;

        spider.core.process_next().await.unwrap();
        assert_eq!(payloads(&spider).await, vec!["1@@http://a", "2@@http://a/1"]);

        // depth 2 is past the bound: dropped without a fetch
        spider.core.process_next().await.unwrap();
        assert_eq!(fetcher.fetched(), vec!["http://a"]);
        assert_eq!(spider.metrics().await.skipped_depth, 1);
        assert_eq!(spider.size().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_children_depth_is_parent_plus_one() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[
            ("http://a", links(&["http://a/1"]).as_str()),
            ("http://a/1", links(&["http://a/1/x"]).as_str()),
        ]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher).await.unwrap();
        spider.add_url_rule("http://a/*").unwrap();
        seed(&spider).await;

        spider.core.process_next().await.unwrap();
        spider.core.process_next().await.unwrap();

        assert_eq!(
            payloads(&spider).await,
            vec!["1@@http://a", "2@@http://a/1", "3@@http://a/1/x"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_largest_depth_bound_still_enqueues_children() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[("http://a", links(&["http://a/1"]).as_str())]);
        let mut settings = settings(&dir);
        settings.max_depth = u32::MAX;

        let spider = Spider::open("site", "http://a", settings, fetcher).await.unwrap();
        spider.add_url_rule("http://a/*").unwrap();
        seed(&spider).await;

        spider.core.process_next().await.unwrap();

        assert_eq!(payloads(&spider).await, vec!["1@@http://a", "2@@http://a/1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_depth_saturates_at_largest_depth() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[("http://a/deep", links(&["http://a/1"]).as_str())]);
        let mut settings = settings(&dir);
        settings.max_depth = u32::MAX;

        let spider = Spider::open("site", "http://a", settings, fetcher.clone()).await.unwrap();
        spider.add_url_rule("http://a/*").unwrap();
        let deepest = CrawlTask {
            depth: u32::MAX,
            url: "http://a/deep".to_string(),
        };
        spider.core.queue.put(&deepest.encode()).await.unwrap();

        spider.core.process_next().await.unwrap();

        assert_eq!(fetcher.fetched(), vec!["http://a/deep"]);
        assert_eq!(
            payloads(&spider).await,
            vec!["4294967295@@http://a/deep", "4294967295@@http://a/1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_failure_stops_the_worker() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher.clone()).await.unwrap();
        seed(&spider).await;
        spider.core.queue.put(b"1@@http://a/1").await.unwrap();
        spider.core.queue.put(b"1@@http://a/2").await.unwrap();
        spider.core.history.close().await.unwrap();

        spider.run().await.unwrap();
        spider.wait().await;

        assert_eq!(spider.state(), SpiderState::Exiting);
        assert_eq!(spider.run_count(), 1);
        assert_eq!(spider.size().await.unwrap(), 2);
        assert!(fetcher.fetched().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_closed_under_running_spider_exits() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[("http://a", links(&["http://a/1"]).as_str())]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher.clone()).await.unwrap();
        spider.add_url_rule("http://a/*").unwrap();
        spider.run().await.unwrap();

        // the worker is inside the politeness delay of the seed
        tokio::time::sleep(Duration::from_millis(500)).await;
        spider.core.queue.close().await.unwrap();
        spider.wait().await;

        assert_eq!(spider.state(), SpiderState::Exiting);
        assert_eq!(fetcher.fetched(), vec!["http://a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_settings_reach_the_fetcher() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .withf(|url, options| {
                url == "http://a"
                    && options.charset.as_deref() == Some("gbk")
                    && options.proxy.as_deref() == Some("socks5://127.0.0.1:1080")
                    && options.headers.get("referer").map(String::as_str) == Some("http://a")
                    && options.user_agent.as_deref() == Some("spider-test")
                    && options.timeout == Some(Duration::from_secs(7))
            })
            .times(1)
            .returning(|_, _| Ok(String::new()));

        let spider = Spider::open("site", "http://a", settings(&dir), Arc::new(fetcher))
            .await
            .unwrap();
        spider
            .charset("gbk")
            .proxy("socks5://127.0.0.1:1080")
            .add_header("referer", "http://a")
            .user_agent("spider-test")
            .timeout(Duration::from_secs(7));
        seed(&spider).await;

        spider.core.process_next().await.unwrap();

        let items = spider.core.queue.find(0, 10).await.unwrap();
        assert_eq!(items[0].status, ItemStatus::Acknowledged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_marks_item_invalid() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .times(1)
            .returning(|_, _| Err(FetchError::Other("connection reset".to_string())));

        let spider = Spider::open("site", "http://a", settings(&dir), Arc::new(fetcher))
            .await
            .unwrap();
        seed(&spider).await;

        spider.core.process_next().await.unwrap();

        let items = spider.core.queue.find(0, 10).await.unwrap();
        assert_eq!(items[0].status, ItemStatus::Invalid);
        assert_eq!(items[0].error, "connection reset");
        assert_eq!(spider.metrics().await.fetch_failures, 1);
        // the URL is still recorded, so it is not retried
        assert!(spider.core.history.contains("http://a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_is_skipped() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockPageFetcher::new());

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher).await.unwrap();
        spider.core.queue.put(b"no separator here").await.unwrap();

        spider.core.process_next().await.unwrap();

        let items = spider.core.queue.find(0, 10).await.unwrap();
        assert_eq!(items[0].status, ItemStatus::Invalid);
        assert_eq!(spider.metrics().await.malformed_items, 1);
        assert_eq!(spider.run_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crawl_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[
            ("http://a", links(&["http://a/1", "http://a/2"]).as_str()),
            ("http://a/1", links(&["http://a", "http://a/2", "http://a/3"]).as_str()),
            ("http://a/2", links(&["http://a/1"]).as_str()),
            ("http://a/3", ""),
        ]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher.clone()).await.unwrap();
        spider.add_url_rule("http://a/*").unwrap();
        spider.add_url_rule("http://a").unwrap();

        spider.run().await.unwrap();
        assert_eq!(spider.state(), SpiderState::Processing);
        spider.wait().await;

        assert_eq!(spider.state(), SpiderState::Exiting);
        assert_eq!(
            fetcher.fetched(),
            vec!["http://a", "http://a/1", "http://a/2", "http://a/3"]
        );
        assert_eq!(spider.run_count(), 4);
        assert_eq!(spider.size().await.unwrap(), 0);
        spider.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_after_configured_idle_polls() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[("http://a", "<p>no links</p>")]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher).await.unwrap();

        let start = tokio::time::Instant::now();
        spider.run().await.unwrap();
        spider.wait().await;

        // one politeness delay, then exactly three idle polls
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 3 * 5));
        assert_eq!(spider.state(), SpiderState::Exiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_is_idempotent_and_exiting_is_terminal() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[("http://a", "")]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher.clone()).await.unwrap();
        spider.run().await.unwrap();
        spider.run().await.unwrap();
        spider.wait().await;

        assert_eq!(fetcher.fetched(), vec!["http://a"]);
        assert!(matches!(spider.run().await, Err(SpiderError::Exited(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_parks_and_run_resumes() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[("http://a", "")]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher.clone()).await.unwrap();
        spider.run().await.unwrap();
        spider.stop();
        assert_eq!(spider.state(), SpiderState::Suspended);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(spider.run_count(), 0);
        assert_eq!(spider.size().await.unwrap(), 1);

        spider.run().await.unwrap();
        assert_eq!(spider.state(), SpiderState::Processing);
        spider.wait().await;
        assert_eq!(fetcher.fetched(), vec!["http://a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_from_persisted_frontier() {
        let dir = TempDir::new().unwrap();
        let root = links(&["http://a/1", "http://a/2"]);
        let first = links(&["http://a"]);
        let pages = [("http://a", root.as_str()), ("http://a/1", first.as_str()), ("http://a/2", "")];

        {
            let fetcher = ScriptedFetcher::with_pages(&pages);
            let spider = Spider::open("site", "http://a", settings(&dir), fetcher).await.unwrap();
            spider.add_url_rule("http://a/*").unwrap();
            seed(&spider).await;
            spider.core.process_next().await.unwrap();
            spider.shutdown().await.unwrap();
        }

        let fetcher = ScriptedFetcher::with_pages(&pages);
        let spider = Spider::open("site", "http://a", settings(&dir), fetcher.clone()).await.unwrap();
        spider.add_url_rule("http://a/*").unwrap();
        spider.add_url_rule("http://a").unwrap();
        spider.run().await.unwrap();
        spider.wait().await;

        assert_eq!(fetcher.fetched(), vec!["http://a/1", "http://a/2"]);
        assert_eq!(spider.queue_stats().await.unwrap().size, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_purges_persisted_state() {
        let dir = TempDir::new().unwrap();
        let fetcher = ScriptedFetcher::with_pages(&[("http://a", "")]);

        let spider = Spider::open("site", "http://a", settings(&dir), fetcher).await.unwrap();
        let queue_path = spider.core.queue.path().to_path_buf();
        let history_path = spider.core.history.path().to_path_buf();
        spider.run().await.unwrap();
        spider.close().await.unwrap();

        assert_eq!(spider.state(), SpiderState::Exiting);
        assert!(!queue_path.exists());
        assert!(!history_path.exists());
        assert!(matches!(spider.close().await, Err(SpiderError::Exited(_))));
        assert!(matches!(spider.run().await, Err(SpiderError::Exited(_))));
    }

    #[tokio::test]
    async fn test_open_requires_identity() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(MockPageFetcher::new());
        let err = Spider::open("", "http://a", settings(&dir), fetcher).await;
        assert!(matches!(err, Err(SpiderError::MissingIdentity)));
    }
}
