use std::fmt;

use thiserror::Error;

/// Separator between the depth prefix and the URL in a queue payload
pub const PAYLOAD_SEPARATOR: &str = "@@";

/// Error decoding a queue payload into a [`CrawlTask`]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TaskError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("payload has no depth separator: {0}")]
    MissingSeparator(String),

    #[error("invalid depth '{0}'")]
    InvalidDepth(String),

    #[error("payload has an empty URL")]
    EmptyUrl,
}

/// A unit of crawl work: a URL and the depth it was discovered at.
///
/// The seed is depth 1; a link found on a page at depth `d` is enqueued at `d + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlTask {
    pub depth: u32,
    pub url: String,
}

impl CrawlTask {
    /// The root task of a crawl
    pub fn seed(url: impl Into<String>) -> Self {
        Self {
            depth: 1,
            url: url.into(),
        }
    }

    /// A task for a link discovered on this task's page
    pub fn child(&self, url: impl Into<String>) -> Self {
        Self {
            depth: self.depth.saturating_add(1),
            url: url.into(),
        }
    }

    /// Queue payload: `depth@@url`
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, TaskError> {
        let raw = std::str::from_utf8(payload).map_err(|_| TaskError::NotUtf8)?;
        let (depth, url) = raw
            .split_once(PAYLOAD_SEPARATOR)
            .ok_or_else(|| TaskError::MissingSeparator(raw.to_string()))?;

        let depth: u32 = depth
            .trim()
            .parse()
            .map_err(|_| TaskError::InvalidDepth(depth.to_string()))?;
        if depth == 0 {
            return Err(TaskError::InvalidDepth(depth.to_string()));
        }
        if url.is_empty() {
            return Err(TaskError::EmptyUrl);
        }

        Ok(Self {
            depth,
            url: url.to_string(),
        })
    }
}

impl fmt::Display for CrawlTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.depth, PAYLOAD_SEPARATOR, self.url)
    }
}
