use std::collections::HashSet;

use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum LinkError {
    #[error("invalid selector: {0}")]
    Selector(String),

    #[error("link '{0}' has no target")]
    NoTarget(String),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Raw `href` values of every anchor in `html`.
///
/// Empty, `#`, `/` and `javascript:` targets are dropped.
pub fn extract_links(html: &str) -> Result<Vec<String>, LinkError> {
    let selector =
        Selector::parse("a[href]").map_err(|e| LinkError::Selector(e.to_string()))?;
    let document = Html::parse_document(html);

    let links = document
        .select(&selector)
        .filter_map(|anchor| anchor.value().attr("href"))
        .map(str::trim)
        .filter(|href| {
            !href.is_empty()
                && *href != "/"
                && *href != "#"
                && !href.to_ascii_lowercase().contains("javascript:")
        })
        .map(str::to_string)
        .collect();

    Ok(links)
}

/// Resolve `link` against the page it was found on.
///
/// Absolute links are returned unchanged; empty and fragment-only links are rejected.
pub fn resolve_absolute(link: &str, base: &str) -> Result<String, LinkError> {
    let link = link.trim();
    if link.is_empty() || link.starts_with('#') {
        return Err(LinkError::NoTarget(link.to_string()));
    }

    if Url::parse(link).is_ok() {
        return Ok(link.to_string());
    }

    let base = Url::parse(base)?;
    Ok(base.join(link)?.to_string())
}

/// Remove duplicates in place, keeping the first occurrence
pub fn dedup(links: &mut Vec<String>) {
    let mut seen = HashSet::new();
    links.retain(|link| seen.insert(link.clone()));
}
