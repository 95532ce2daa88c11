// kiln-net/src/http.rs
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kiln_common::cache::Cache;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::SourceLocator;
use rand::Rng;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use tracing::{debug, error, warn};

use crate::validation::{validate_url, verify_bytes};

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = "kiln formula executor (Rust)";

/// Fetch service: returns the complete payload behind `url` or a terminal error.
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

impl<F: Fetch + ?Sized> Fetch for Arc<F> {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        (**self).fetch(url)
    }
}

/// reqwest-backed fetcher for `https` URLs that also reads local `file` URLs.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        let client = Client::builder()
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let parsed = validate_url(url)?;
        if parsed.scheme() == "file" {
            let path = parsed.to_file_path().map_err(|_| {
                KilnError::ValidationError(format!("'{url}' is not a valid file URL"))
            })?;
            debug!("Reading local payload {}", path.display());
            return fs::read(&path).map_err(|e| {
                KilnError::DownloadError(
                    path.display().to_string(),
                    url.to_string(),
                    e.to_string(),
                )
            });
        }

        let response = self.client.get(url).send()?;
        let status = response.status();
        debug!("Received HTTP status: {} for {}", status, url);
        if !status.is_success() {
            let file_name = url.rsplit('/').next().unwrap_or(url).to_string();
            let reason = match status {
                StatusCode::NOT_FOUND => "Resource not found (404)".to_string(),
                StatusCode::FORBIDDEN => "Access forbidden (403)".to_string(),
                other => format!("HTTP error {other}"),
            };
            error!("Download of {} failed: {}", url, reason);
            return Err(KilnError::DownloadError(file_name, url.to_string(), reason));
        }
        Ok(response.bytes()?.to_vec())
    }
}

/// Exponential backoff with jitter, applied by the caller around `Fetch`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1` (attempts count from 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = capped.as_millis() as u64 / 4;
        let jitter = if jitter_ms > 0 {
            rand::rng().random_range(0..=jitter_ms)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }

    fn is_retryable(err: &KilnError) -> bool {
        matches!(
            err,
            KilnError::Http(_) | KilnError::DownloadError(..) | KilnError::Io(_)
        )
    }

    pub fn fetch(&self, fetcher: &dyn Fetch, url: &str) -> Result<Vec<u8>> {
        let mut attempt = 1;
        loop {
            match fetcher.fetch(url) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt < self.max_attempts && Self::is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Fetch of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        url, attempt, self.max_attempts, e, delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Fetches payloads through a download cache, verifying every byte stream
/// (cached or fresh) before handing it out.
pub struct Downloader {
    fetcher: Arc<dyn Fetch>,
    cache: Option<Cache>,
    retry: RetryPolicy,
}

impl Downloader {
    pub fn new(fetcher: Arc<dyn Fetch>, cache: Option<Cache>) -> Self {
        Self {
            fetcher,
            cache,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the verified payload behind `locator`, trying mirrors after
    /// the primary URL when a fetch fails. A checksum mismatch is never retried.
    pub fn fetch_verified(
        &self,
        locator: &SourceLocator,
        target: &str,
        what: &str,
    ) -> Result<Vec<u8>> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.load(&locator.sha256, &locator.url)? {
                match verify_bytes(&bytes, &locator.sha256, target, what) {
                    Ok(()) => {
                        debug!("[{}] Using cached {} ({} bytes)", target, what, bytes.len());
                        return Ok(bytes);
                    }
                    Err(e) => {
                        debug!("[{}] Cached {} is stale ({}). Redownloading.", target, what, e);
                        if let Err(remove_err) = cache.remove(&locator.sha256, &locator.url) {
                            debug!("Failed to remove stale cache entry: {}", remove_err);
                        }
                    }
                }
            }
        }

        let mut last_error: Option<KilnError> = None;
        for url in std::iter::once(&locator.url).chain(locator.mirrors.iter()) {
            validate_url(url)?;
            debug!("[{}] Fetching {} from {}", target, what, url);
            let bytes = match self.retry.fetch(self.fetcher.as_ref(), url) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("[{}] Download attempt failed from {}: {}", target, url, e);
                    last_error = Some(e);
                    continue;
                }
            };
            verify_bytes(&bytes, &locator.sha256, target, what)?;
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.store(&locator.sha256, &locator.url, &bytes) {
                    warn!("[{}] Could not cache {}: {}", target, what, e);
                }
            }
            return Ok(bytes);
        }

        Err(last_error.unwrap_or_else(|| {
            KilnError::DownloadError(
                target.to_string(),
                locator.url.clone(),
                "All download attempts failed.".to_string(),
            )
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::validation::sha256_hex;

    #[derive(Default)]
    struct MapFetcher {
        payloads: HashMap<String, Vec<u8>>,
        failures_left: Mutex<HashMap<String, usize>>,
        calls: AtomicUsize,
    }

    impl Fetch for MapFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures_left.lock().unwrap();
            if let Some(left) = failures.get_mut(url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(KilnError::DownloadError(
                        "x".into(),
                        url.into(),
                        "flaky".into(),
                    ));
                }
            }
            self.payloads.get(url).cloned().ok_or_else(|| {
                KilnError::DownloadError("x".into(), url.into(), "404".into())
            })
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn locator(url: &str, payload: &[u8], mirrors: &[&str]) -> SourceLocator {
        SourceLocator {
            url: url.to_string(),
            sha256: sha256_hex(payload),
            mirrors: mirrors.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn retries_transient_failures() {
        let url = "https://example.test/a.tar.gz";
        let mut fetcher = MapFetcher::default();
        fetcher.payloads.insert(url.into(), b"abc".to_vec());
        fetcher.failures_left.lock().unwrap().insert(url.into(), 2);
        let fetcher = Arc::new(fetcher);

        let downloader = Downloader::new(fetcher.clone(), None).with_retry(quick_retry());
        let bytes = downloader
            .fetch_verified(&locator(url, b"abc", &[]), "a", "source")
            .unwrap();
        assert_eq!(bytes, b"abc");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn falls_back_to_mirror() {
        let mut fetcher = MapFetcher::default();
        fetcher
            .payloads
            .insert("https://mirror.test/a.tar.gz".into(), b"abc".to_vec());
        let downloader =
            Downloader::new(Arc::new(fetcher), None).with_retry(RetryPolicy::no_retry());
        let loc = locator("https://gone.test/a.tar.gz", b"abc", &["https://mirror.test/a.tar.gz"]);
        assert_eq!(downloader.fetch_verified(&loc, "a", "source").unwrap(), b"abc");
    }

    #[test]
    fn mismatch_is_fatal_and_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new_in(dir.path()).unwrap();
        let url = "https://example.test/evil.tar.gz";
        let mut fetcher = MapFetcher::default();
        fetcher.payloads.insert(url.into(), b"tampered".to_vec());
        let downloader = Downloader::new(Arc::new(fetcher), Some(cache.clone()));

        let loc = locator(url, b"original", &[]);
        let err = downloader.fetch_verified(&loc, "evil", "source").unwrap_err();
        assert!(matches!(err, KilnError::ChecksumMismatch { .. }));
        assert!(cache.load(&loc.sha256, url).unwrap().is_none());
    }

    #[test]
    fn cached_payload_is_reverified() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new_in(dir.path()).unwrap();
        let url = "https://example.test/b.tar.gz";
        let loc = locator(url, b"good", &[]);
        cache.store(&loc.sha256, url, b"corrupted").unwrap();

        let mut fetcher = MapFetcher::default();
        fetcher.payloads.insert(url.into(), b"good".to_vec());
        let fetcher = Arc::new(fetcher);
        let downloader = Downloader::new(fetcher.clone(), Some(cache.clone()));

        assert_eq!(downloader.fetch_verified(&loc, "b", "source").unwrap(), b"good");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.load(&loc.sha256, url).unwrap().unwrap(), b"good");

        // Second call is served from the cache.
        downloader.fetch_verified(&loc, "b", "source").unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert!(policy.delay_for(1) >= Duration::from_millis(100));
        assert!(policy.delay_for(2) >= Duration::from_millis(200));
        assert!(policy.delay_for(6) <= Duration::from_millis(375));
    }

    #[test]
    fn http_fetcher_reads_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.tar.gz");
        fs::write(&path, b"local").unwrap();
        let url = url::Url::from_file_path(&path).unwrap();
        let fetcher = HttpFetcher::new().unwrap();
        assert_eq!(fetcher.fetch(url.as_str()).unwrap(), b"local");
    }
}
