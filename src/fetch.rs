use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use reqwest::{header, Client, StatusCode};

use crate::error::DownloadError;

/// Byte-level progress callback: (bytes received, total if known).
pub type ByteProgress<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[derive(Debug, Clone)]
pub struct FetchedBuffer {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub final_url: String,
}

/// The raw fetch primitive: download a URL into memory, reporting byte-level
/// progress. Implementations must map HTTP 429 to `DownloadError::RateLimited`.
#[async_trait]
pub trait BufferFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        on_progress: Option<ByteProgress<'_>>,
    ) -> Result<FetchedBuffer, DownloadError>;

    async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let fetched = self.fetch(url, None).await?;
        Ok(String::from_utf8_lossy(&fetched.bytes).into_owned())
    }
}

pub struct HttpFetcher {
    client: Client,
    rate_limiter: Option<Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
}

impl HttpFetcher {
    pub fn new(rate_limit_bytes_per_sec: Option<u32>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("tunedl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        let rate_limiter = rate_limit_bytes_per_sec.and_then(NonZeroU32::new).map(|limit| {
            let quota = Quota::per_second(limit);
            Arc::new(RateLimiter::direct(quota))
        });

        Self { client, rate_limiter }
    }
}

#[async_trait]
impl BufferFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        on_progress: Option<ByteProgress<'_>>,
    ) -> Result<FetchedBuffer, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(DownloadError::transport)?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(DownloadError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(DownloadError::Transport(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let final_url = response.url().to_string();
        let total = response.content_length();

        let mut bytes: Vec<u8> = Vec::with_capacity(total.unwrap_or(0) as usize);
        let mut stream = response.bytes_stream();

        while let Some(item) = stream.next().await {
            let chunk = item.map_err(DownloadError::transport)?;
            let len = chunk.len();

            if len > 0 {
                if let Some(limiter) = &self.rate_limiter {
                    if let Some(nonzero) = NonZeroU32::new(len as u32) {
                        let _ = limiter.until_n_ready(nonzero).await;
                    }
                }

                bytes.extend_from_slice(&chunk);
                if let Some(report) = on_progress {
                    report(bytes.len() as u64, total);
                }
            }
        }

        debug!("fetched {} bytes from {}", bytes.len(), url);
        Ok(FetchedBuffer {
            bytes,
            content_type,
            final_url,
        })
    }
}
