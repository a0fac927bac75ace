//! Source clip download into a run's scratch directory.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::redirect::Policy;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;

use vmerge_models::{ClipRequest, FetchedClip};

use crate::command::wait_cancelled;
use crate::error::{FetchError, FetchFailure, MediaError, MediaResult};
use crate::fs_utils::remove_quietly;
use crate::validate::{is_internal_host, is_internal_ip};

/// Default per-fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
/// Default per-file byte ceiling (500 MiB).
pub const DEFAULT_MAX_CLIP_BYTES: u64 = 500 * 1024 * 1024;

const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 5;

/// Content types accepted besides `video/*`.
const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/octet-stream",
    "binary/octet-stream",
    "application/mp4",
];

/// Byte allowance shared by every fetch of one run.
#[derive(Debug, Clone)]
pub struct ByteBudget {
    used: Arc<AtomicU64>,
    limit: u64,
}

impl ByteBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            used: Arc::new(AtomicU64::new(0)),
            limit,
        }
    }

    /// Reserve `bytes`; fails once the shared total passes the limit.
    pub fn consume(&self, bytes: u64) -> Result<(), u64> {
        let total = self.used.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if total > self.limit {
            Err(total)
        } else {
            Ok(())
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A connection or redirect target refused because it is not public.
#[derive(Debug)]
struct BlockedAddress(String);

impl fmt::Display for BlockedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} targets an internal address", self.0)
    }
}

impl std::error::Error for BlockedAddress {}

/// DNS resolver that only hands public addresses to the connector.
#[derive(Debug, Default)]
struct PublicOnlyResolver;

impl Resolve for PublicOnlyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_public(name.as_str().to_string()))
    }
}

async fn resolve_public(host: String) -> Result<Addrs, BoxError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
        .await?
        .filter(|addr| !is_internal_ip(&addr.ip()))
        .collect();
    if addrs.is_empty() {
        return Err(Box::new(BlockedAddress(host)));
    }
    Ok(Box::new(addrs.into_iter()))
}

/// Follows at most [`MAX_REDIRECTS`] hops; every hop is screened like the
/// original URL unless private hosts are allowed.
fn redirect_policy(allow_private_hosts: bool) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        if allow_private_hosts {
            return attempt.follow();
        }
        let target = attempt.url();
        let blocked = target.host().map_or(true, |host| is_internal_host(&host));
        if blocked {
            let host = target.host_str().unwrap_or_default().to_string();
            return attempt.error(BlockedAddress(host));
        }
        attempt.follow()
    })
}

/// Downloads source clips over HTTP(S).
#[derive(Debug, Clone)]
pub struct ClipFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_file_bytes: u64,
}

impl ClipFetcher {
    /// Unless `allow_private_hosts` is set, redirect targets and resolved
    /// addresses on loopback or private networks are refused.
    pub fn new(timeout: Duration, max_file_bytes: u64, allow_private_hosts: bool) -> MediaResult<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(timeout.min(MAX_CONNECT_TIMEOUT))
            .redirect(redirect_policy(allow_private_hosts))
            .user_agent(concat!("vmerge/", env!("CARGO_PKG_VERSION")));
        if !allow_private_hosts {
            builder = builder.dns_resolver(Arc::new(PublicOnlyResolver));
        }
        let client = builder
            .build()
            .map_err(|e| MediaError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            max_file_bytes,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Download one clip into `dest_dir`.
    ///
    /// The partial file is removed on every failure path, including
    /// cancellation and timeout.
    pub async fn fetch(
        &self,
        request: &ClipRequest,
        dest_dir: &Path,
        budget: &ByteBudget,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<FetchedClip, FetchError> {
        let position = request.position;
        let url = parse_clip_url(request)?;
        let local_path = dest_dir.join(local_file_name(position, &url));

        debug!(position, url = %url, path = %local_path.display(), "Fetching clip");

        let download = tokio::time::timeout(
            self.timeout,
            self.download(position, url, &local_path, budget),
        );

        let result = match cancel {
            Some(mut rx) => tokio::select! {
                res = download => res,
                _ = wait_cancelled(&mut rx) => {
                    remove_quietly(&local_path).await;
                    return Err(FetchError::new(position, FetchFailure::Cancelled, "download cancelled"));
                }
            },
            None => download.await,
        };

        let outcome = match result {
            Ok(inner) => inner,
            Err(_) => Err(FetchError::new(
                position,
                FetchFailure::Timeout,
                format!("download did not finish within {}s", self.timeout.as_secs()),
            )),
        };

        match outcome {
            Ok(byte_size) => {
                metrics::counter!("vmerge_fetched_bytes_total").increment(byte_size);
                Ok(FetchedClip {
                    position,
                    local_path,
                    byte_size,
                    retrieved_at: Utc::now(),
                })
            }
            Err(e) => {
                warn!(position, reason = %e.reason, "Clip download failed: {}", e.message);
                remove_quietly(&local_path).await;
                Err(e)
            }
        }
    }

    async fn download(
        &self,
        position: usize,
        url: Url,
        path: &Path,
        budget: &ByteBudget,
    ) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_request_error(position, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                position,
                FetchFailure::HttpStatus(status.as_u16()),
                format!("server responded with {}", status),
            ));
        }

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if !is_allowed_content_type(content_type) {
                return Err(FetchError::new(
                    position,
                    FetchFailure::UnsupportedContentType,
                    format!("content type '{}' is not a video", content_type),
                ));
            }
        }

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(len) = declared {
            if len > self.max_file_bytes {
                return Err(size_exceeded(position, len, self.max_file_bytes));
            }
        }

        let io_err = |e: std::io::Error| FetchError::new(position, FetchFailure::Io, e.to_string());
        let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_request_error(position, &e))?;
            let len = chunk.len() as u64;

            written += len;
            if written > self.max_file_bytes {
                return Err(size_exceeded(position, written, self.max_file_bytes));
            }
            if let Err(total) = budget.consume(len) {
                return Err(FetchError::new(
                    position,
                    FetchFailure::SizeExceeded,
                    format!(
                        "run byte budget exhausted ({} of {} bytes)",
                        total,
                        budget.limit()
                    ),
                ));
            }

            file.write_all(&chunk).await.map_err(io_err)?;
        }

        file.flush().await.map_err(io_err)?;
        Ok(written)
    }
}

fn size_exceeded(position: usize, size: u64, limit: u64) -> FetchError {
    FetchError::new(
        position,
        FetchFailure::SizeExceeded,
        format!("clip is {} bytes, limit is {} bytes", size, limit),
    )
}

fn is_blocked_address(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if e.is::<BlockedAddress>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn classify_request_error(position: usize, err: &reqwest::Error) -> FetchError {
    let reason = if is_blocked_address(err) || err.is_redirect() {
        FetchFailure::InvalidUrl
    } else if err.is_timeout() {
        FetchFailure::Timeout
    } else if err.is_builder() {
        FetchFailure::InvalidUrl
    } else {
        FetchFailure::ConnectionReset
    };
    FetchError::new(position, reason, err.to_string())
}

fn parse_clip_url(request: &ClipRequest) -> Result<Url, FetchError> {
    let invalid = |msg: String| FetchError::new(request.position, FetchFailure::InvalidUrl, msg);

    let url = Url::parse(request.url.trim()).map_err(|e| invalid(format!("{}: {}", e, request.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("URL has no host".to_string()));
    }
    Ok(url)
}

fn is_allowed_content_type(value: &str) -> bool {
    let mime = value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime.starts_with("video/") || ALLOWED_CONTENT_TYPES.contains(&mime.as_str())
}

/// `clip_{position:02}.{ext}`, with the extension taken from the URL path.
pub fn local_file_name(position: usize, url: &Url) -> PathBuf {
    let ext = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| (1..=5).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "mp4".to_string());

    PathBuf::from(format!("clip_{:02}.{}", position, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_utils::count_files;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> ClipFetcher {
        ClipFetcher::new(Duration::from_secs(5), 1024, false).unwrap()
    }

    fn video(body: &[u8]) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_bytes(body.to_vec())
            .insert_header("content-type", "video/mp4")
    }

    #[test]
    fn test_local_file_name() {
        let url = Url::parse("https://cdn.test/a/clip.MOV?sig=1").unwrap();
        assert_eq!(local_file_name(3, &url), PathBuf::from("clip_03.mov"));
        let url = Url::parse("https://cdn.test/download").unwrap();
        assert_eq!(local_file_name(0, &url), PathBuf::from("clip_00.mp4"));
        let url = Url::parse("https://cdn.test/v.not-an-ext").unwrap();
        assert_eq!(local_file_name(11, &url), PathBuf::from("clip_11.mp4"));
    }

    #[test]
    fn test_content_type_admission() {
        assert!(is_allowed_content_type("video/mp4"));
        assert!(is_allowed_content_type("Video/QuickTime; charset=binary"));
        assert!(is_allowed_content_type("application/octet-stream"));
        assert!(!is_allowed_content_type("text/html; charset=utf-8"));
    }

    #[test]
    fn test_byte_budget() {
        let budget = ByteBudget::new(10);
        assert!(budget.consume(6).is_ok());
        assert!(budget.clone().consume(4).is_ok());
        assert_eq!(budget.consume(1), Err(11));
    }

    #[tokio::test]
    async fn test_fetch_writes_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(video(b"0123456789"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let request = ClipRequest::new(format!("{}/a.mp4", server.uri()), 1);
        let clip = fetcher()
            .fetch(&request, dir.path(), &ByteBudget::new(1 << 20), None)
            .await
            .unwrap();

        assert_eq!(clip.position, 1);
        assert_eq!(clip.byte_size, 10);
        assert_eq!(clip.local_path, dir.path().join("clip_01.mp4"));
        assert_eq!(std::fs::read(&clip.local_path).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_http_status_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let request = ClipRequest::new(format!("{}/missing.mp4", server.uri()), 0);
        let err = fetcher()
            .fetch(&request, dir.path(), &ByteBudget::new(1 << 20), None)
            .await
            .unwrap_err();

        assert_eq!(err.reason, FetchFailure::HttpStatus(404));
        assert_eq!(count_files(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_html_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html></html>")
                    .insert_header("content-type", "text/html"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let request = ClipRequest::new(format!("{}/page", server.uri()), 0);
        let err = fetcher()
            .fetch(&request, dir.path(), &ByteBudget::new(1 << 20), None)
            .await
            .unwrap_err();
        assert_eq!(err.reason, FetchFailure::UnsupportedContentType);
    }

    #[tokio::test]
    async fn test_oversized_clip_leaves_no_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(video(&[0u8; 4096]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let request = ClipRequest::new(format!("{}/big.mp4", server.uri()), 0);
        let err = fetcher()
            .fetch(&request, dir.path(), &ByteBudget::new(1 << 20), None)
            .await
            .unwrap_err();

        assert_eq!(err.reason, FetchFailure::SizeExceeded);
        assert_eq!(count_files(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_shared_budget_is_enforced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(video(&[1u8; 600]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let budget = ByteBudget::new(1000);
        let fetcher = fetcher();
        fetcher
            .fetch(&ClipRequest::new(format!("{}/a.mp4", server.uri()), 0), dir.path(), &budget, None)
            .await
            .unwrap();
        let err = fetcher
            .fetch(&ClipRequest::new(format!("{}/b.mp4", server.uri()), 1), dir.path(), &budget, None)
            .await
            .unwrap_err();

        assert_eq!(err.reason, FetchFailure::SizeExceeded);
        assert!(!dir.path().join("clip_01.mp4").exists());
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(video(b"late").set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = ClipFetcher::new(Duration::from_millis(200), 1024, false).unwrap();
        let request = ClipRequest::new(format!("{}/slow.mp4", server.uri()), 2);
        let err = fetcher
            .fetch(&request, dir.path(), &ByteBudget::new(1 << 20), None)
            .await
            .unwrap_err();
        assert_eq!(err.reason, FetchFailure::Timeout);
        assert_eq!(err.position, 2);
    }

    #[tokio::test]
    async fn test_cancel_removes_partial_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(video(b"late").set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(false);
        let request = ClipRequest::new(format!("{}/slow.mp4", server.uri()), 0);

        let scratch = dir.path().to_path_buf();
        let handle = tokio::spawn(async move {
            fetcher()
                .fetch(&request, &scratch, &ByteBudget::new(1 << 20), Some(rx))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.reason, FetchFailure::Cancelled);
        assert_eq!(count_files(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_non_http_scheme_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let request = ClipRequest::new("ftp://example.com/a.mp4", 0);
        let err = fetcher()
            .fetch(&request, dir.path(), &ByteBudget::new(1 << 20), None)
            .await
            .unwrap_err();
        assert_eq!(err.reason, FetchFailure::InvalidUrl);
    }

    #[tokio::test]
    async fn test_redirect_to_metadata_service_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "http://169.254.169.254/latest/meta-data/"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let request = ClipRequest::new(format!("{}/a.mp4", server.uri()), 1);
        let err = fetcher()
            .fetch(&request, dir.path(), &ByteBudget::new(1 << 20), None)
            .await
            .unwrap_err();

        assert_eq!(err.reason, FetchFailure::InvalidUrl);
        assert_eq!(err.position, 1);
        assert_eq!(count_files(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_redirect_to_loopback_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(
                ResponseTemplate::new(301)
                    .insert_header("location", format!("{}/internal.mp4", server.uri()).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/internal.mp4"))
            .respond_with(video(b"secret"))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let request = ClipRequest::new(format!("{}/a.mp4", server.uri()), 0);
        let err = fetcher()
            .fetch(&request, dir.path(), &ByteBudget::new(1 << 20), None)
            .await
            .unwrap_err();
        assert_eq!(err.reason, FetchFailure::InvalidUrl);
    }

    #[tokio::test]
    async fn test_redirect_followed_when_private_hosts_allowed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.mp4"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("{}/moved.mp4", server.uri()).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/moved.mp4"))
            .respond_with(video(b"moved"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = ClipFetcher::new(Duration::from_secs(5), 1024, true).unwrap();
        let request = ClipRequest::new(format!("{}/a.mp4", server.uri()), 0);
        let clip = fetcher
            .fetch(&request, dir.path(), &ByteBudget::new(1 << 20), None)
            .await
            .unwrap();
        assert_eq!(clip.byte_size, 5);
    }

    #[tokio::test]
    async fn test_name_resolving_to_loopback_is_not_contacted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(video(b"secret"))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let request = ClipRequest::new(
            format!("http://localhost:{}/a.mp4", server.address().port()),
            0,
        );
        let result = fetcher()
            .fetch(&request, dir.path(), &ByteBudget::new(1 << 20), None)
            .await;

        assert!(result.is_err());
        assert_eq!(count_files(dir.path()).await, 0);
    }

    #[tokio::test]
    async fn test_resolver_drops_internal_addresses() {
        assert!(resolve_public("localhost".to_string()).await.is_err());
        assert!(resolve_public("127.0.0.1".to_string()).await.is_err());
    }
}
