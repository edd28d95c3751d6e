use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

use durable_spider::crawler::SpiderSettings;
use durable_spider::fetch::FetchOptions;

/// A named spider configuration, stored as YAML
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SpiderProfile {
    pub spider: SpiderSection,
    pub fetch: FetchSection,
}

/// Scheduler settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SpiderSection {
    pub data_dir: PathBuf,
    pub max_depth: u32, // 0 = unbounded
    pub politeness_delay_ms: u64,
    pub idle_interval_ms: u64,
    pub idle_retries: u32,
    pub concurrency: usize, // Spiders running at once when crawling several seeds
    pub url_rules: Vec<String>,
    pub visit_rules: Vec<String>,
}

/// HTTP settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct FetchSection {
    pub charset: Option<String>,
    pub proxy: Option<String>,
    pub headers: HashMap<String, String>,
    pub user_agent: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl Default for SpiderSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("queuedata"),
            max_depth: 0,
            politeness_delay_ms: 1000,
            idle_interval_ms: 5000,
            idle_retries: 3,
            concurrency: 2,
            url_rules: vec![],
            visit_rules: vec![],
        }
    }
}

impl Default for SpiderProfile {
    fn default() -> Self {
        Self {
            spider: SpiderSection::default(),
            fetch: FetchSection {
                user_agent: Some(format!("durable-spider/{}", env!("CARGO_PKG_VERSION"))),
                timeout_secs: Some(30),
                ..Default::default()
            },
        }
    }
}

impl SpiderProfile {
    pub fn settings(&self) -> SpiderSettings {
        SpiderSettings {
            data_dir: self.spider.data_dir.clone(),
            max_depth: self.spider.max_depth,
            politeness_delay: Duration::from_millis(self.spider.politeness_delay_ms),
            idle_interval: Duration::from_millis(self.spider.idle_interval_ms),
            idle_retries: self.spider.idle_retries,
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            charset: self.fetch.charset.clone(),
            proxy: self.fetch.proxy.clone(),
            headers: self.fetch.headers.clone(),
            user_agent: self.fetch.user_agent.clone(),
            timeout: self.fetch.timeout_secs.map(Duration::from_secs),
        }
    }

    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "durable-spider", "durable-spider")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Load the default profile, writing it out on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let profile = Self::default();
            profile.save_as_default()?;
            Ok(profile)
        }
    }

    /// Load a named profile from `sites/<name>.yaml`
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir()
            .join("sites")
            .join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// `load_profile`, except that "default" reads `default.yaml`
    pub fn resolve(profile: &str) -> Result<Self> {
        if profile == "default" {
            Self::load_default()
        } else {
            Self::load_profile(profile)
        }
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))
    }

    fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn save_as_default(&self) -> Result<()> {
        let config_path = Self::config_dir().join("default.yaml");
        self.save_to_file(&config_path)
    }

    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let profile_path = Self::config_dir()
            .join("sites")
            .join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// Names of the profiles under `sites/`
    pub fn list_profiles() -> Result<Vec<String>> {
        let sites_dir = Self::config_dir().join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();
        for entry in fs::read_dir(sites_dir)? {
            let path = entry?.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }
}
