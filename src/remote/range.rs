// HTTP range reader
//
// Random access over a remote object using `Range: bytes=a-b` requests. Reads
// are split into fixed-size blocks; fetched blocks are kept in a moka cache so
// re-reading a region does not go back to the server.

use crate::index::{IndexError, IndexResult, clamp_read};
use crate::metrics;
use crate::source::ByteSource;
use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};

/// Block size and cache capacity for a range reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeOptions {
    pub block_size: u64,
    /// Blocks kept in memory, 0 disables the cache
    pub cached_blocks: u64,
}

impl Default for RangeOptions {
    fn default() -> Self {
        Self { block_size: 64 * 1024, cached_blocks: 4096 }
    }
}

pub struct HttpRangeReader {
    client: reqwest::Client,
    url: String,
    len: u64,
    block_size: u64,
    cache: Option<Cache<u64, Bytes>>,
}

impl std::fmt::Debug for HttpRangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRangeReader")
            .field("url", &self.url)
            .field("len", &self.len)
            .field("block_size", &self.block_size)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl HttpRangeReader {
    /// Query `url` with a one-byte range request to learn its length
    pub async fn open(
        client: reqwest::Client,
        url: impl Into<String>,
        options: RangeOptions,
    ) -> IndexResult<Self> {
        let url = url.into();
        let response = client.get(&url).header(RANGE, "bytes=0-0").send().await?;
        let status = response.status();

        let len = match status {
            StatusCode::PARTIAL_CONTENT | StatusCode::RANGE_NOT_SATISFIABLE => response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .ok_or_else(|| IndexError::RangeNotSupported(url.clone()))?,
            s if s.is_success() => return Err(IndexError::RangeNotSupported(url)),
            _ => {
                response.error_for_status()?;
                return Err(IndexError::RangeNotSupported(url));
            }
        };

        tracing::debug!(url = %url, len, "Opened range reader");
        Ok(Self::with_length(client, url, len, options))
    }

    /// Reader over an object whose length is already known, skipping the size request
    pub fn with_length(
        client: reqwest::Client,
        url: impl Into<String>,
        len: u64,
        options: RangeOptions,
    ) -> Self {
        let cache = (options.cached_blocks > 0)
            .then(|| Cache::builder().max_capacity(options.cached_blocks).build());

        Self { client, url: url.into(), len, block_size: options.block_size.max(1), cache }
    }

    /// Fetch bytes `[start, end]` (inclusive)
    async fn fetch(&self, start: u64, end: u64) -> IndexResult<Bytes> {
        metrics::with(|m| m.range_requests.inc());

        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", start, end))
            .send()
            .await?;

        let want = (end - start + 1) as usize;
        let body = match response.status() {
            StatusCode::PARTIAL_CONTENT => response.bytes().await?,
            // Whole object returned; usable only when the range starts at zero
            StatusCode::OK if start == 0 => {
                let mut body = response.bytes().await?;
                body.truncate(want);
                body
            }
            s if s.is_success() => return Err(IndexError::RangeNotSupported(self.url.clone())),
            _ => {
                response.error_for_status()?;
                return Err(IndexError::RangeNotSupported(self.url.clone()));
            }
        };

        metrics::with(|m| m.range_bytes_fetched.inc_by(body.len() as u64));
        tracing::trace!(url = %self.url, start, end, received = body.len(), "Range fetched");
        Ok(body)
    }

    async fn block(&self, index: u64) -> IndexResult<Bytes> {
        let start = index * self.block_size;
        let end = (start + self.block_size).min(self.len) - 1;

        let Some(cache) = &self.cache else {
            return self.fetch(start, end).await;
        };

        if let Some(block) = cache.get(&index).await {
            metrics::with(|m| m.range_cache_hits.inc());
            return Ok(block);
        }

        cache.try_get_with(index, self.fetch(start, end)).await.map_err(IndexError::Shared)
    }
}

#[async_trait]
impl ByteSource for HttpRangeReader {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> IndexResult<usize> {
        let n = clamp_read(self.len, offset, buf.len());
        if n == 0 {
            return Ok(0);
        }

        if self.cache.is_none() {
            let data = self.fetch(offset, offset + n as u64 - 1).await?;
            let got = data.len().min(n);
            buf[..got].copy_from_slice(&data[..got]);
            return Ok(got);
        }

        let mut filled = 0usize;
        while filled < n {
            let pos = offset + filled as u64;
            let block = self.block(pos / self.block_size).await?;
            let within = (pos % self.block_size) as usize;
            if within >= block.len() {
                break;
            }
            let take = (block.len() - within).min(n - filled);
            buf[filled..filled + take].copy_from_slice(&block[within..within + take]);
            filled += take;
        }
        Ok(filled)
    }

    fn size(&self) -> Option<u64> {
        Some(self.len)
    }
}

/// Total length from a `Content-Range` value such as `bytes 0-0/1234` or `bytes */0`
pub fn parse_content_range(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 0-0/1234"), Some(1234));
        assert_eq!(parse_content_range("bytes 100-199/200"), Some(200));
        assert_eq!(parse_content_range("bytes */0"), Some(0));
        assert_eq!(parse_content_range(" bytes 0-0/42 "), Some(42));
    }

    #[test]
    fn test_parse_content_range_unknown_length() {
        assert_eq!(parse_content_range("bytes 0-0/*"), None);
        assert_eq!(parse_content_range("items 0-0/10"), None);
        assert_eq!(parse_content_range("bytes 0-0"), None);
    }

    #[test]
    fn test_with_length_cache_toggle() {
        let client = reqwest::Client::new();
        let cached = HttpRangeReader::with_length(
            client.clone(),
            "http://localhost/a.tar",
            10,
            RangeOptions::default(),
        );
        assert!(cached.cache.is_some());
        assert_eq!(cached.size(), Some(10));

        let uncached = HttpRangeReader::with_length(
            client,
            "http://localhost/a.tar",
            10,
            RangeOptions { block_size: 0, cached_blocks: 0 },
        );
        assert!(uncached.cache.is_none());
        assert_eq!(uncached.block_size, 1);
    }

    #[tokio::test]
    async fn test_read_past_end_does_not_touch_network() {
        let reader = HttpRangeReader::with_length(
            reqwest::Client::new(),
            "http://127.0.0.1:9/unreachable.tar",
            10,
            RangeOptions::default(),
        );
        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(&mut buf, 10).await.unwrap(), 0);
        assert_eq!(reader.read_at(&mut buf, 50).await.unwrap(), 0);
    }
}
