use std::collections::HashMap;

use async_trait::async_trait;
use encoding_rs::Encoding;
use reqwest::header::USER_AGENT;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::debug;

use crate::fetch::{FetchError, FetchOptions, PageFetcher};

/// `reqwest`-backed page fetcher.
///
/// One client is kept per proxy setting; headers, user agent and timeout are
/// applied per request.
#[derive(Default)]
pub struct HttpFetcher {
    clients: Mutex<HashMap<String, Client>>,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client_for(&self, proxy: Option<&str>) -> Result<Client, FetchError> {
        let key = proxy.unwrap_or_default().to_string();
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder();
        if let Some(proxy) = proxy {
            let proxy_config =
                reqwest::Proxy::all(proxy).map_err(|e| FetchError::InvalidProxy {
                    proxy: proxy.to_string(),
                    message: e.to_string(),
                })?;
            builder = builder.proxy(proxy_config);
        }

        let client = builder.build()?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str, options: &FetchOptions) -> Result<String, FetchError> {
        let encoding = match options.charset.as_deref() {
            Some(label) => Some(
                Encoding::for_label(label.as_bytes())
                    .ok_or_else(|| FetchError::UnknownCharset(label.to_string()))?,
            ),
            None => None,
        };

        let client = self.client_for(options.proxy.as_deref()).await?;
        let mut request = client.get(url);
        if let Some(user_agent) = &options.user_agent {
            request = request.header(USER_AGENT, user_agent);
        }
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if let Some(timeout) = options.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let html = match encoding {
            Some(encoding) => {
                let body = response.bytes().await?;
                let (text, _, had_errors) = encoding.decode(&body);
                if had_errors {
                    debug!("Malformed {} sequences in {}", encoding.name(), url);
                }
                text.into_owned()
            }
            None => response.text().await?,
        };

        debug!("Fetched {} ({} bytes)", url, html.len());
        Ok(html)
    }
}
