use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cli::config::SpiderProfile;
use durable_spider::crawler::Spider;
use durable_spider::fetch::{HttpFetcher, PageFetcher};
use durable_spider::pipe::Pipe;
use durable_spider::storage::{DurableQueue, VisitHistory, MAX_FIND_LIMIT};

/// Crawl every seed with its own spider, at most `concurrency` at a time
pub async fn crawl(
    seeds: Vec<String>,
    profile: String,
    name: String,
    depth: Option<u32>,
    rules: Vec<String>,
) -> Result<()> {
    let mut config = SpiderProfile::resolve(&profile)
        .context(format!("Failed to load profile: {}", profile))?;

    if let Some(d) = depth {
        config.spider.max_depth = d;
    }
    config.spider.url_rules.extend(rules);

    if config.spider.url_rules.is_empty() {
        warn!("No URL rules configured: only the seed pages will be crawled");
    }

    let jobs = spider_names(&name, seeds);
    let concurrency = config.spider.concurrency;
    let config = Arc::new(config);
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new());

    Pipe::new(jobs, concurrency)
        .run(move |(name, seed)| run_spider(name, seed, config.clone(), fetcher.clone()))
        .await
}

/// One spider name per seed; several seeds get an index suffix
fn spider_names(name: &str, seeds: Vec<String>) -> Vec<(String, String)> {
    if seeds.len() == 1 {
        return seeds.into_iter().map(|seed| (name.to_string(), seed)).collect();
    }

    seeds
        .into_iter()
        .enumerate()
        .map(|(index, seed)| (format!("{}-{}", name, index), seed))
        .collect()
}

async fn run_spider(
    name: String,
    seed: String,
    config: Arc<SpiderProfile>,
    fetcher: Arc<dyn PageFetcher>,
) -> Result<()> {
    let spider = Spider::open(&name, &seed, config.settings(), fetcher)
        .await
        .context(format!("Failed to open spider '{}'", name))?;

    spider.fetch_options(config.fetch_options());
    spider.url_rules(&config.spider.url_rules)?;
    for rule in &config.spider.visit_rules {
        let spider_name = name.clone();
        spider.on_visit(rule, move |url, html| {
            info!("[{}] visited {} ({} bytes)", spider_name, url, html.len());
        })?;
    }

    spider.run().await?;

    tokio::select! {
        _ = spider.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, suspending spider '{}'", name);
            spider.stop();
        }
    }

    let metrics = spider.metrics().await;
    let stats = spider.queue_stats().await?;
    spider.shutdown().await?;

    println!("Spider: {} ({})", name, seed);
    println!("Items processed: {}", spider.run_count());
    println!("Queue: {} queued, {} read, {} acknowledged", stats.size, stats.read_size, stats.ack_size);
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    Ok(())
}

/// Fail unless a spider has a queue under `data_dir`
fn ensure_exists(name: &str, data_dir: &Path) -> Result<()> {
    let queue_path = data_dir.join(format!("{}.queue.redb", name));
    if !queue_path.exists() {
        anyhow::bail!("No spider '{}' under {}", name, data_dir.display());
    }
    Ok(())
}

/// Print the queue statistics of a spider
pub async fn status(name: String, profile: String) -> Result<()> {
    let config = SpiderProfile::resolve(&profile)?;
    ensure_exists(&name, &config.spider.data_dir)?;

    let queue = DurableQueue::open(&name, &config.spider.data_dir).await?;
    let stats = queue.stats().await?;
    queue.close().await?;

    println!("Spider: {}", name);
    println!("Queued: {}", stats.size);
    println!("Read: {}", stats.read_size);
    println!("Acknowledged: {}", stats.ack_size);
    println!("Pending: {}", stats.depth());
    println!("Created: {}", stats.created_at);
    println!("Last Updated: {}", stats.updated_at);

    Ok(())
}

/// Print a page of a spider's queue items
pub async fn inspect(name: String, profile: String, offset: usize, limit: usize) -> Result<()> {
    let config = SpiderProfile::resolve(&profile)?;
    ensure_exists(&name, &config.spider.data_dir)?;

    if limit > MAX_FIND_LIMIT {
        warn!("Limit {} capped at {}", limit, MAX_FIND_LIMIT);
    }

    let queue = DurableQueue::open(&name, &config.spider.data_dir).await?;
    let items = queue.find(offset, limit).await?;
    queue.close().await?;

    for item in items {
        let payload = String::from_utf8_lossy(&item.payload);
        if item.error.is_empty() {
            println!("{:>6}  {:<12} {}", item.id, item.status, payload);
        } else {
            println!("{:>6}  {:<12} {}  ({})", item.id, item.status, payload, item.error);
        }
    }

    Ok(())
}

/// Delete both persisted stores of a spider
pub async fn purge(name: String, profile: String) -> Result<()> {
    let config = SpiderProfile::resolve(&profile)?;
    purge_stores(&name, &config.spider.data_dir).await?;

    println!("Purged spider: {}", name);
    Ok(())
}

/// Delete whichever of the queue and history files exist
async fn purge_stores(name: &str, data_dir: &Path) -> Result<()> {
    let queue_path = data_dir.join(format!("{}.queue.redb", name));
    let history_path = data_dir.join(format!("{}.history.redb", name));
    if !queue_path.exists() && !history_path.exists() {
        anyhow::bail!("No spider '{}' under {}", name, data_dir.display());
    }

    if queue_path.exists() {
        DurableQueue::open(name, data_dir).await?.delete().await?;
    }
    if history_path.exists() {
        VisitHistory::open(name, data_dir).await?.delete().await?;
    }
    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = SpiderProfile::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from the defaults if it does not exist
pub fn manage_profile(profile_name: String) -> Result<()> {
    match SpiderProfile::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            SpiderProfile::default().save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the default configuration
pub fn show_config() -> Result<()> {
    let config = SpiderProfile::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}
