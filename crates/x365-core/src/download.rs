//! Fetches a remote file to disk, following redirects by hand.
//!
//! The destination either ends up holding the complete resource or does not exist.
//! The one exception is a transfer that finished cleanly but produced zero bytes: that
//! file is left in place for the caller to inspect.

use crate::config::DownloadOptions;
use crate::error::{CoreError, CoreResult};
use reqwest::header::LOCATION;
use reqwest::{Response, StatusCode};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// One in-flight fetch. Lives only for the duration of a `download` call.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub source_url: Url,
    pub destination: PathBuf,
    pub attempt: u32,
}

enum Step {
    Redirect(String),
    Done(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    options: DownloadOptions,
}

impl Downloader {
    pub fn new(options: DownloadOptions) -> CoreResult<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none());
        if !options.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| CoreError::Network(describe(&e)))?;
        Ok(Self { client, options })
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Downloads `url` to `destination`, calling `progress` with 0-100 per received
    /// chunk when the server announces a length.
    pub async fn download<P>(&self, url: &str, destination: &Path, progress: P) -> CoreResult<PathBuf>
    where
        P: FnMut(u8),
    {
        self.download_with_cancel(url, destination, &CancellationToken::new(), progress)
            .await
    }

    pub async fn download_with_cancel<P>(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancellationToken,
        mut progress: P,
    ) -> CoreResult<PathBuf>
    where
        P: FnMut(u8),
    {
        let source_url = parse_source(url)?;
        ensure_parent(destination).await?;

        let mut task = DownloadTask {
            source_url,
            destination: destination.to_path_buf(),
            attempt: 1,
        };
        info!(url = %task.source_url, dest = %destination.display(), "starting download");

        let max = self.options.max_redirects;
        let last = max.saturating_add(1);
        for attempt in 1..=last {
            task.attempt = attempt;
            match self.fetch(&task, cancel, &mut progress).await? {
                Step::Done(path) => {
                    info!(dest = %path.display(), redirects = attempt - 1, "download complete");
                    return Ok(path);
                }
                Step::Redirect(location) => {
                    if attempt > max {
                        break;
                    }
                    let next = resolve_redirect(&task.source_url, &location)?;
                    debug!(attempt, from = %task.source_url, to = %next, "following redirect");
                    task.source_url = next;
                }
            }
        }

        Err(CoreError::TooManyRedirects(last))
    }

    async fn fetch<P>(
        &self,
        task: &DownloadTask,
        cancel: &CancellationToken,
        progress: &mut P,
    ) -> CoreResult<Step>
    where
        P: FnMut(u8),
    {
        let mut partial = PartialFile::create(&task.destination).await?;

        let request = self.client.get(task.source_url.clone()).send();
        let mut response = self.bounded(cancel, request).await?.map_err(transport)?;

        let status = response.status();
        if is_redirect(status) {
            let location = redirect_location(&response)?;
            return Ok(Step::Redirect(location));
        }
        if status != StatusCode::OK {
            return Err(CoreError::HttpStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown error").to_string(),
            });
        }

        let total = response.content_length().filter(|len| *len > 0);
        let mut received: u64 = 0;
        while let Some(chunk) = self.bounded(cancel, response.chunk()).await?.map_err(transport)? {
            partial.write(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                progress(percent(received, total));
            }
        }
        debug!(received, ?total, "response body received");

        partial.finish().await.map(Step::Done)
    }

    /// Applies the inactivity timeout and the caller's cancellation to one I/O wait.
    async fn bounded<F: Future>(&self, cancel: &CancellationToken, fut: F) -> CoreResult<F::Output> {
        let limit = self.options.idle_timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            res = tokio::time::timeout(limit, fut) => res.map_err(|_| CoreError::Timeout(limit)),
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

fn redirect_location(response: &Response) -> CoreResult<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CoreError::InvalidRedirect {
            location: String::new(),
            reason: format!("{} response without a Location header", response.status().as_u16()),
        })
}

fn parse_source(url: &str) -> CoreResult<Url> {
    let parsed = Url::parse(url).map_err(|e| CoreError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !is_http(&parsed) {
        return Err(CoreError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {:?}", parsed.scheme()),
        });
    }
    Ok(parsed)
}

/// Resolves a `Location` value against the URL that produced it. Absolute targets may
/// switch between http and https.
fn resolve_redirect(current: &Url, location: &str) -> CoreResult<Url> {
    let next = current.join(location).map_err(|e| CoreError::InvalidRedirect {
        location: location.to_string(),
        reason: e.to_string(),
    })?;
    if !is_http(&next) {
        return Err(CoreError::InvalidRedirect {
            location: location.to_string(),
            reason: format!("unsupported scheme {:?}", next.scheme()),
        });
    }
    Ok(next)
}

fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

async fn ensure_parent(destination: &Path) -> CoreResult<()> {
    let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|source| CoreError::DownloadDir {
            path: parent.to_path_buf(),
            source,
        })
}

fn percent(received: u64, total: u64) -> u8 {
    (received.min(total) * 100 / total) as u8
}

fn transport(err: reqwest::Error) -> CoreError {
    if err.is_timeout() {
        return CoreError::Network(format!("request timed out: {}", describe(&err)));
    }
    CoreError::Network(describe(&err))
}

/// reqwest's top-level message rarely says what went wrong; the cause chain does.
fn describe(err: &dyn std::error::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}

/// Output file of a single attempt. Removed on drop unless `finish` succeeded.
struct PartialFile {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    keep: bool,
}

impl PartialFile {
    async fn create(path: &Path) -> CoreResult<Self> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|source| CoreError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            keep: false,
        })
    }

    async fn write(&mut self, bytes: &[u8]) -> CoreResult<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        file.write_all(bytes).await.map_err(|source| CoreError::Write {
            path: self.path.clone(),
            source,
        })
    }

    async fn finish(mut self) -> CoreResult<PathBuf> {
        if let Some(mut file) = self.file.take() {
            let synced = async {
                file.flush().await?;
                file.sync_all().await
            }
            .await;
            synced.map_err(|source| CoreError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        self.keep = true;

        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.len() > 0 => Ok(self.path.clone()),
            _ => Err(CoreError::EmptyDownload(self.path.clone())),
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        drop(self.file.take());
        // Inline so the path is gone before the error reaches the caller.
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove partial download");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct Request {
        path: String,
        head: String,
        base: String,
    }

    enum Reply {
        Raw(Vec<u8>),
        Hang,
    }

    struct TestServer {
        base: String,
        hits: Arc<AtomicUsize>,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    /// One request per connection, answered by `handler` and then closed.
    async fn serve<F>(handler: F) -> TestServer
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);

        let server_base = base.clone();
        let server_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                let hits = server_hits.clone();
                let base = server_base.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    hits.fetch_add(1, Ordering::SeqCst);
                    let head = String::from_utf8_lossy(&buf).into_owned();
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    match handler(&Request { path, head, base }) {
                        Reply::Raw(bytes) => {
                            let _ = stream.write_all(&bytes).await;
                            let _ = stream.shutdown().await;
                        }
                        Reply::Hang => {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                });
            }
        });

        TestServer { base, hits }
    }

    fn reply(status: &str, headers: &[(&str, String)], body: &[u8], with_length: bool) -> Reply {
        let mut out = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
        for (name, value) in headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        if with_length {
            out.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(body);
        Reply::Raw(bytes)
    }

    fn ok(body: &[u8]) -> Reply {
        reply("200 OK", &[], body, true)
    }

    fn redirect(location: String) -> Reply {
        reply("302 Found", &[("Location", location)], b"", true)
    }

    fn downloader() -> Downloader {
        Downloader::new(DownloadOptions {
            use_system_proxy: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn follows_absolute_redirect_to_body() {
        let body = payload(1000);
        let served = body.clone();
        let server = serve(move |req| match req.path.as_str() {
            "/pkg.zip" => redirect(format!("{}/final/pkg.zip", req.base)),
            "/final/pkg.zip" => ok(&served),
            _ => reply("404 Not Found", &[], b"", true),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x").join("pkg.zip");
        let mut seen = Vec::new();
        let path = downloader()
            .download(&server.url("/pkg.zip"), &dest, |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(path, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert_eq!(server.hits(), 2);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100));
    }

    #[tokio::test]
    async fn follows_relative_redirect() {
        let server = serve(|req| match req.path.as_str() {
            "/a/start" => redirect("/final/pkg.zip".to_string()),
            "/final/pkg.zip" => ok(b"zipdata"),
            _ => reply("404 Not Found", &[], b"", true),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg.zip");
        downloader()
            .download(&server.url("/a/start"), &dest, |_| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"zipdata");
    }

    #[tokio::test]
    async fn gives_up_after_ten_redirects() {
        let server = serve(|req| {
            let n: u32 = req.path.trim_start_matches("/hop/").parse().unwrap_or(0);
            redirect(format!("/hop/{}", n + 1))
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg.zip");
        let err = downloader()
            .download(&server.url("/hop/0"), &dest, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::TooManyRedirects(11)), "{err}");
        assert_eq!(server.hits(), 11);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn huge_redirect_limit_from_settings_still_downloads() {
        let mut settings: crate::settings::ManagerSettings =
            serde_json::from_str(r#"{"download": {"maxRedirects": 4294967295}}"#).unwrap();
        settings.download.use_system_proxy = false;
        assert_eq!(settings.download.max_redirects, u32::MAX);

        let server = serve(|req| match req.path.as_str() {
            "/start" => redirect("/pkg.zip".to_string()),
            _ => ok(b"payload"),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg.zip");
        Downloader::new(settings.download)
            .unwrap()
            .download(&server.url("/start"), &dest, |_| {})
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert_eq!(server.hits(), 2);
    }

    #[tokio::test]
    async fn missing_location_is_rejected() {
        let server = serve(|_| reply("301 Moved Permanently", &[], b"", true)).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg.zip");
        let err = downloader()
            .download(&server.url("/pkg.zip"), &dest, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidRedirect { .. }), "{err}");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn not_found_cleans_up() {
        let server = serve(|_| reply("404 Not Found", &[], b"nope", true)).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg.zip");
        std::fs::write(&dest, b"stale").unwrap();

        let err = downloader()
            .download(&server.url("/pkg.zip"), &dest, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::HttpStatus { status: 404, .. }), "{err}");
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn connection_refused_cleans_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg.zip");
        let err = downloader()
            .download(&format!("http://{addr}/pkg.zip"), &dest, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Network(_)), "{err}");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn inactivity_timeout_cleans_up() {
        let server = serve(|_| Reply::Hang).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg.zip");
        let client = Downloader::new(DownloadOptions {
            use_system_proxy: false,
            idle_timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();

        let err = client
            .download(&server.url("/pkg.zip"), &dest, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Timeout(_)), "{err}");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn cancellation_cleans_up() {
        let server = serve(|_| Reply::Hang).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg.zip");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = downloader()
            .download_with_cancel(&server.url("/pkg.zip"), &dest, &cancel, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Cancelled), "{err}");
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn unknown_length_completes_without_progress() {
        let body = payload(4096);
        let served = body.clone();
        let server = serve(move |_| reply("200 OK", &[], &served, false)).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg.zip");
        let mut calls = 0;
        downloader()
            .download(&server.url("/pkg.zip"), &dest, |_| calls += 1)
            .await
            .unwrap();

        assert_eq!(calls, 0);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn empty_body_is_an_integrity_error_and_kept() {
        let server = serve(|_| ok(b"")).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("pkg.zip");

        let err = downloader()
            .download(&server.url("/pkg.zip"), &dest, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::EmptyDownload(_)), "{err}");
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn sends_identifying_user_agent() {
        let server = serve(|req| {
            if req.head.to_ascii_lowercase().contains("user-agent: x365-manager/") {
                ok(b"ok")
            } else {
                reply("403 Forbidden", &[], b"", true)
            }
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        downloader()
            .download(&server.url("/pkg.zip"), &dir.path().join("pkg.zip"), |_| {})
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_non_http_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = downloader()
            .download("ftp://example.test/pkg.zip", &dir.path().join("pkg.zip"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidUrl { .. }));
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn uncreatable_directory_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let err = downloader()
            .download("http://127.0.0.1:9/pkg.zip", &blocker.join("sub").join("pkg.zip"), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DownloadDir { .. }), "{err}");
    }

    #[test]
    fn redirect_resolution() {
        let base = Url::parse("https://example.test/dl/pkg.zip").unwrap();
        assert_eq!(
            resolve_redirect(&base, "/final/pkg.zip").unwrap().as_str(),
            "https://example.test/final/pkg.zip"
        );
        assert_eq!(
            resolve_redirect(&base, "http://mirror.test/pkg.zip").unwrap().as_str(),
            "http://mirror.test/pkg.zip"
        );
        assert!(resolve_redirect(&base, "file:///etc/passwd").is_err());
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent(0, 1000), 0);
        assert_eq!(percent(500, 1000), 50);
        assert_eq!(percent(1000, 1000), 100);
        assert_eq!(percent(1200, 1000), 100);
    }
}
