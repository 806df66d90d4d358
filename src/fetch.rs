//! HTTP polling of a GTFS-realtime vehicle position feed.

use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use reqwest::header::{HeaderValue, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::debug;

use crate::codec::{self, DecodedFeed};
use crate::error::{Error, Result};

/// Placeholder replaced by the key for `FeedAuth::Url`.
pub const URL_KEY_PLACEHOLDER: &str = "PASSWORD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedAuth {
    None,
    /// Key sent in the named header.
    Header { name: String, keys: Vec<String> },
    /// Key substituted into the feed URL.
    Url { keys: Vec<String> },
}

impl FeedAuth {
    /// Picks one key at random so load spreads across a key pool.
    fn pick_key(keys: &[String]) -> Option<String> {
        keys.choose(&mut rand::thread_rng()).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSource {
    pub url: String,
    pub auth: FeedAuth,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum FetchOutcome {
    /// The server answered 304.
    NotModified,
    /// The feed header timestamp is not newer than the last one seen.
    Unchanged,
    Updated(DecodedFeed),
}

pub struct FeedFetcher {
    client: Client,
    source: FeedSource,
    etag: Option<HeaderValue>,
    last_modified: Option<HeaderValue>,
    last_feed_timestamp: Option<u64>,
}

impl FeedFetcher {
    pub fn new(source: FeedSource) -> Result<Self> {
        let client = Client::builder().gzip(true).build()?;
        Ok(Self {
            client,
            source,
            etag: None,
            last_modified: None,
            last_feed_timestamp: None,
        })
    }

    pub fn source(&self) -> &FeedSource {
        &self.source
    }

    /// Header timestamp of the last feed handed out as `Updated`.
    pub fn last_feed_timestamp(&self) -> Option<u64> {
        self.last_feed_timestamp
    }

    fn request(&self) -> RequestBuilder {
        let mut url = self.source.url.clone();
        let mut header = None;

        match &self.source.auth {
            FeedAuth::None => {}
            FeedAuth::Header { name, keys } => {
                if let Some(key) = FeedAuth::pick_key(keys) {
                    header = Some((name.clone(), key));
                }
            }
            FeedAuth::Url { keys } => {
                if let Some(key) = FeedAuth::pick_key(keys) {
                    url = url.replace(URL_KEY_PLACEHOLDER, &key);
                }
            }
        }

        let mut request = self.client.get(url).timeout(self.source.timeout);

        if let Some((name, key)) = header {
            request = request.header(name, key);
        }
        if let Some(etag) = &self.etag {
            request = request.header(IF_NONE_MATCH, etag.clone());
        }
        if let Some(last_modified) = &self.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified.clone());
        }

        request
    }

    pub async fn poll(&mut self) -> Result<FetchOutcome> {
        let started = Instant::now();
        let response = self.request().send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            debug!(url = %self.source.url, "feed not modified");
            return Ok(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(Error::HttpStatus(status));
        }

        let etag = response.headers().get(ETAG).cloned();
        let last_modified = response.headers().get(LAST_MODIFIED).cloned();
        let bytes = response.bytes().await?;

        debug!(
            url = %self.source.url,
            bytes = bytes.len(),
            elapsed = ?started.elapsed(),
            "fetched feed"
        );

        let feed = codec::decode_feed(&bytes)?;

        // Validators are only trusted once the body decoded.
        self.etag = etag;
        self.last_modified = last_modified;

        if !is_newer(self.last_feed_timestamp, feed.header.timestamp) {
            debug!(
                url = %self.source.url,
                timestamp = ?feed.header.timestamp,
                "feed timestamp unchanged"
            );
            return Ok(FetchOutcome::Unchanged);
        }

        if feed.header.timestamp.is_some() {
            self.last_feed_timestamp = feed.header.timestamp;
        }

        Ok(FetchOutcome::Updated(feed))
    }
}

/// A feed without a header timestamp is always treated as new.
fn is_newer(last_seen: Option<u64>, incoming: Option<u64>) -> bool {
    match (last_seen, incoming) {
        (Some(last_seen), Some(incoming)) => incoming > last_seen,
        _ => true,
    }
}
