pub mod http;
pub mod links;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

// Re-export common types
pub use http::HttpFetcher;
pub use links::{dedup, extract_links, resolve_absolute, LinkError};

/// Errors from fetching a page
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("invalid proxy '{proxy}': {message}")]
    InvalidProxy { proxy: String, message: String },

    #[error("unknown charset '{0}'")]
    UnknownCharset(String),

    #[error("{0}")]
    Other(String),
}

/// Per-request settings the spider passes to its fetcher
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
    /// Charset label used to decode the body, e.g. `gbk` or `windows-1252`.
    /// The body is decoded by the response headers when unset.
    pub charset: Option<String>,

    /// Proxy URL for every request (`http://`, `https://` or `socks5://`)
    pub proxy: Option<String>,

    /// Extra request headers
    pub headers: HashMap<String, String>,

    pub user_agent: Option<String>,

    pub timeout: Option<Duration>,
}

/// Retrieves the HTML of a page
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str, options: &FetchOptions) -> Result<String, FetchError>;
}
