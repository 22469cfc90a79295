#![forbid(unsafe_code)]

//! Thumbnail download with a best-first candidate ladder.

use std::{io::Read, time::Duration};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{metadata::Platform, security::is_safe_video_id};

/// Anything this small is a placeholder ("no thumbnail") image.
pub const MIN_THUMBNAIL_BYTES: usize = 5000;
const MAX_THUMBNAIL_BYTES: u64 = 16 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("only http(s) thumbnails can be fetched: {0}")]
    UnsupportedUrl(String),
    #[error("thumbnail request failed: {0}")]
    Request(#[from] Box<ureq::Error>),
    #[error("response is {0}, not an image")]
    NotImage(String),
    #[error("image of {0} bytes looks like a placeholder")]
    TooSmall(usize),
    #[error("reading thumbnail body: {0}")]
    Io(#[from] std::io::Error),
}

/// URLs to try, best first. A usable video id puts the platform's size
/// ladder ahead of the client URL.
pub fn thumbnail_candidates(url: &str, video_id: Option<&str>) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(id) = video_id.map(str::trim).filter(|id| is_safe_video_id(id)) {
        candidates.extend(Platform::YouTube.thumbnail_ladder(id));
    }
    let url = url.trim();
    if !url.is_empty() && !candidates.iter().any(|candidate| candidate == url) {
        candidates.push(url.to_string());
    }
    candidates
}

/// Returns the first candidate `fetch` accepts.
pub fn select_first_usable<F>(candidates: &[String], mut fetch: F) -> Option<Thumbnail>
where
    F: FnMut(&str) -> Result<Thumbnail, ThumbnailError>,
{
    candidates.iter().find_map(|candidate| match fetch(candidate) {
        Ok(thumbnail) => Some(thumbnail),
        Err(err) => {
            debug!(candidate = %candidate, "thumbnail candidate rejected: {err}");
            None
        }
    })
}

fn check_usable(content_type: &str, len: usize) -> Result<(), ThumbnailError> {
    if !content_type.starts_with("image/") {
        return Err(ThumbnailError::NotImage(content_type.to_string()));
    }
    if len <= MIN_THUMBNAIL_BYTES {
        return Err(ThumbnailError::TooSmall(len));
    }
    Ok(())
}

/// Blocking HTTP client; use [`ThumbnailFetcher::fetch_first`] from async code.
#[derive(Clone)]
pub struct ThumbnailFetcher {
    agent: ureq::Agent,
}

impl Default for ThumbnailFetcher {
    fn default() -> Self {
        Self::new(FETCH_TIMEOUT)
    }
}

impl ThumbnailFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(5)
            .build();
        Self { agent }
    }

    pub fn fetch(&self, url: &str) -> Result<Thumbnail, ThumbnailError> {
        let parsed = Url::parse(url).map_err(|_| ThumbnailError::UnsupportedUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ThumbnailError::UnsupportedUrl(url.to_string()));
        }

        let response = self.agent.get(parsed.as_str()).call().map_err(Box::new)?;
        let content_type = response.content_type().to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(ThumbnailError::NotImage(content_type));
        }

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_THUMBNAIL_BYTES)
            .read_to_end(&mut bytes)?;
        check_usable(&content_type, bytes.len())?;
        Ok(Thumbnail {
            content_type,
            bytes,
        })
    }

    /// Walks `candidates` on the blocking pool.
    pub async fn fetch_first(&self, candidates: Vec<String>) -> Option<Thumbnail> {
        let fetcher = self.clone();
        let found = tokio::task::spawn_blocking(move || {
            select_first_usable(&candidates, |url| fetcher.fetch(url))
        })
        .await
        .ok()
        .flatten();
        if let Some(thumbnail) = &found {
            info!(bytes = thumbnail.bytes.len(), "thumbnail fetched");
        }
        found
    }
}
