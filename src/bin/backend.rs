#![forbid(unsafe_code)]

//! Axum backend for AquaSeal.
//!
//! Every route that reaches yt-dlp checks the URL against the content policy
//! before spawning anything, and checks the fetched metadata before the first
//! byte goes out. Downloads are relayed straight from yt-dlp's stdout; no
//! media ever touches the disk.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use aquaseal_tools::{
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    extractor::{Extractor, ExtractorError, StreamOptions},
    metadata::{self, MERGE_CONTAINER, NormalizedVideoInfo},
    playlist::{DownloadExtras, PlaylistInfo, PlaylistQuality, parse_playlist},
    policy::{BlockList, BlockReason, ContentPolicy},
    relay::{self, RelayError, RelayStart},
    security::{
        FilenameStyle, attachment_disposition, ensure_not_root, sanitize_filename,
        underscore_filename,
    },
    thumbnail::{ThumbnailFetcher, thumbnail_candidates},
};
use axum::{
    Json, Router,
    body::Body,
    extract::{FromRequest, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "aquaseal_tools=info,backend=info,tower_http=info";
const X_EXPECTED_SIZE: HeaderName = HeaderName::from_static("x-expected-size");

/// Command-line flags. Each one overrides the matching environment/.env key.
#[derive(Debug, Parser)]
#[command(name = "backend", about = "AquaSeal download API")]
struct BackendArgs {
    /// Listen address (AQUASEAL_HOST).
    #[arg(long)]
    host: Option<IpAddr>,
    /// Listen port (AQUASEAL_PORT, PORT).
    #[arg(long)]
    port: Option<u16>,
    /// yt-dlp executable (YT_DLP_BIN).
    #[arg(long)]
    extractor: Option<PathBuf>,
    /// TOML file with extra blocked domains/keywords (AQUASEAL_BLOCKLIST).
    #[arg(long)]
    blocklist: Option<PathBuf>,
    /// Static front-end to serve for non-API paths (WWW_ROOT).
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Path of the .env file to read.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            extractor: self.extractor,
            blocklist: self.blocklist,
            www_root: self.www_root,
            env_path: self.env_file,
        }
    }
}

/// Shared, read-only request context.
#[derive(Clone)]
struct AppState {
    policy: Arc<ContentPolicy>,
    extractor: Extractor,
    thumbnails: ThumbnailFetcher,
    www_root: Option<Arc<PathBuf>>,
}

impl AppState {
    fn new(config: &RuntimeConfig, policy: ContentPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            extractor: Extractor::new(&config.extractor)
                .with_timeout(config.extractor_timeout)
                .with_max_concurrent(config.max_concurrent),
            thumbnails: ThumbnailFetcher::default(),
            www_root: config.www_root.clone().map(Arc::new),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    category: &'static str,
    message: String,
    details: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    category: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

impl ApiError {
    fn new(status: StatusCode, category: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            category,
            message: message.into(),
            details: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    /// 500 carrying the extractor's own diagnostic.
    fn upstream(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            details: details.filter(|details| !details.trim().is_empty()),
            ..Self::new(StatusCode::INTERNAL_SERVER_ERROR, "extractor_failed", message)
        }
    }

    fn extractor(message: &str, err: &ExtractorError) -> Self {
        warn!("{message}: {err}");
        let details = err
            .diagnostic()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        Self::upstream(message, Some(details))
    }

    fn relay(message: &str, err: &RelayError) -> Self {
        warn!("{message}: {err}");
        let details = err
            .diagnostic()
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        Self::upstream(message, Some(details))
    }
}

impl From<BlockReason> for ApiError {
    fn from(reason: BlockReason) -> Self {
        info!(?reason, "request blocked by content policy");
        Self::new(StatusCode::FORBIDDEN, "policy_rejected", reason.message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            category: self.category,
            details: self.details.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `Json` whose rejections use the API error body.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| ApiError::bad_request(rejection.body_text()))?;
        Ok(Self(value))
    }
}

#[derive(Debug, Default, Deserialize)]
struct UrlRequest {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    url: Option<String>,
    format_id: Option<String>,
    expected_size: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThumbnailRequest {
    url: Option<String>,
    video_id: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PlaylistDownloadRequest {
    url: Option<String>,
    quality: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    options: DownloadExtras,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    message: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = BackendArgs::parse();
    ensure_not_root("backend")?;
    let config = resolve_runtime_config(args.into_overrides())?;

    let blocklist = match &config.blocklist {
        Some(path) => BlockList::with_file(path)
            .with_context(|| format!("loading block-list {}", path.display()))?,
        None => BlockList::default(),
    };
    info!(
        domains = blocklist.domains().len(),
        keywords = blocklist.keywords().len(),
        "content policy loaded"
    );

    let cors = cors_layer(&config.allowed_origins)?;
    let state = AppState::new(&config, ContentPolicy::new(blocklist));
    let app = router(state).layer(cors);

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(extractor = %config.extractor.display(), "API server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/video-info", post(video_info))
        .route("/api/download", post(download))
        .route("/api/download-thumbnail", post(download_thumbnail))
        .route("/api/playlist-info", post(playlist_info))
        .route("/api/download-playlist-video", post(download_playlist_video))
        .fallback(static_fallback)
        .with_state(state)
}

/// Browser clients need the size and filename headers exposed explicitly.
fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .expose_headers([
            header::CONTENT_LENGTH,
            header::CONTENT_DISPOSITION,
            X_EXPECTED_SIZE,
        ]);
    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid origin {origin:?} in ALLOWED_ORIGINS"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}

fn require_url(url: Option<String>, message: &str) -> ApiResult<String> {
    url.map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request(message))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "AquaSeal API is running",
    })
}

async fn video_info(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<UrlRequest>,
) -> ApiResult<Json<NormalizedVideoInfo>> {
    let url = require_url(request.url, "Video URL is required")?;
    state.policy.classify_url(&url).into_result()?;

    info!(url = %url, "fetching video info");
    let doc = state
        .extractor
        .fetch_metadata(&url)
        .await
        .map_err(|err| ApiError::extractor("Failed to fetch video information", &err))?;
    state.policy.classify_metadata(&doc).into_result()?;

    let normalized = metadata::normalize(&doc, &url);
    info!(id = %normalized.id, formats = normalized.formats.len(), "video info ready");
    Ok(Json(normalized))
}

async fn download(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<DownloadRequest>,
) -> ApiResult<Response> {
    let url = require_url(request.url, "Video URL is required")?;
    state.policy.classify_url(&url).into_result()?;

    // The title names the file and the document is checked before any byte
    // is sent, so metadata comes first even for a known format id.
    let doc = state
        .extractor
        .fetch_metadata(&url)
        .await
        .map_err(|err| ApiError::extractor("Failed to fetch video information", &err))?;
    state.policy.classify_metadata(&doc).into_result()?;

    let format_id = request.format_id.as_deref();
    let expected_size = request
        .expected_size
        .filter(|size| *size > 0)
        .or_else(|| metadata::expected_download_size(&doc, format_id));
    let title = sanitize_filename(doc.title.as_deref().unwrap_or_default(), FilenameStyle::Title);
    let filename = format!("{title}.{MERGE_CONTAINER}");
    let options = StreamOptions::video(relay::format_selector(format_id));

    info!(url = %url, format = %options.format, ?expected_size, "starting download");
    let started = relay::start(&state.extractor, &url, &options)
        .await
        .map_err(|err| ApiError::relay("Failed to download video", &err))?;
    stream_response(started, &filename, expected_size)
}

async fn download_thumbnail(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ThumbnailRequest>,
) -> ApiResult<Response> {
    let url = require_url(request.url, "Thumbnail URL is required")?;
    state.policy.classify_url(&url).into_result()?;

    let candidates = thumbnail_candidates(&url, request.video_id.as_deref());
    let thumbnail = state
        .thumbnails
        .fetch_first(candidates)
        .await
        .ok_or_else(|| ApiError::not_found("Thumbnail not found"))?;

    let stem = underscore_filename(request.title.as_deref().unwrap_or_default(), "thumbnail");
    let filename = format!("{stem}_thumbnail.jpg");
    let mut response = Body::from(thumbnail.bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, header_value(&thumbnail.content_type)?);
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&attachment_disposition(&filename))?,
    );
    Ok(response)
}

async fn playlist_info(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<UrlRequest>,
) -> ApiResult<Json<PlaylistInfo>> {
    let url = require_url(request.url, "Playlist URL is required")?;
    state.policy.classify_url(&url).into_result()?;

    info!(url = %url, "fetching playlist info");
    let output = state
        .extractor
        .fetch_playlist(&url)
        .await
        .map_err(|err| ApiError::extractor("Failed to fetch playlist information", &err))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() && stdout.trim().is_empty() {
        warn!(status = %output.status, "playlist listing failed without output");
        return Err(ApiError::upstream(
            "Failed to fetch playlist information",
            Some(output.stderr),
        ));
    }

    let playlist = parse_playlist(&stdout).screen(&state.policy)?;
    info!(id = %playlist.id, videos = playlist.video_count, "playlist info ready");
    Ok(Json(playlist))
}

async fn download_playlist_video(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<PlaylistDownloadRequest>,
) -> ApiResult<Response> {
    let url = require_url(request.url, "Video URL is required")?;
    state.policy.classify_url(&url).into_result()?;

    let doc = state
        .extractor
        .fetch_metadata(&url)
        .await
        .map_err(|err| ApiError::extractor("Failed to fetch video information", &err))?;
    state.policy.classify_metadata(&doc).into_result()?;

    let quality = PlaylistQuality::parse(request.quality.as_deref());
    let stem = sanitize_filename(
        request.filename.as_deref().unwrap_or_default(),
        FilenameStyle::ClientSupplied,
    );
    let filename = format!("{stem}.{}", quality.extension());
    let options = quality.stream_options(&request.options);

    info!(url = %url, ?quality, "starting playlist entry download");
    let started = relay::start(&state.extractor, &url, &options)
        .await
        .map_err(|err| ApiError::relay("Failed to download video", &err))?;
    stream_response(started, &filename, None)
}

/// Wraps a started relay in a download response. The supervisor keeps
/// running on its own once the handle is dropped.
fn stream_response(
    started: RelayStart,
    filename: &str,
    expected_size: Option<u64>,
) -> ApiResult<Response> {
    let RelayStart { body, .. } = started;
    let mime = MimeGuess::from_path(filename).first_or_octet_stream();

    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, header_value(mime.as_ref())?);
    headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&attachment_disposition(filename))?,
    );
    if let Some(size) = expected_size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        headers.insert(X_EXPECTED_SIZE, HeaderValue::from(size));
    }
    Ok(response)
}

fn header_value(value: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| ApiError::internal("invalid response header"))
}

async fn static_fallback(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }
    let Some(root) = state.www_root.as_deref() else {
        return ApiError::not_found("file not found").into_response();
    };

    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(&root.join("index.html")).await,
        Ok(_) => stream_file(&target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(&root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes have no extension; asset misses stay 404.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: &Path) -> ApiResult<Response> {
    let file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let mut headers = HeaderMap::new();
    let mime = MimeGuess::from_path(path).first_or_octet_stream();
    headers.insert(header::CONTENT_TYPE, header_value(mime.as_ref())?);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use std::{fs, time::Duration};
    use tempfile::{TempDir, tempdir};

    const CLIP_JSON: &str = r#"{"id":"abc123","title":"My Clip: Part 1","uploader":"Chef","duration":61,"view_count":5,"age_limit":0,"formats":[{"format_id":"137","vcodec":"avc1","acodec":"none","height":1080,"ext":"mp4","filesize":1000},{"format_id":"140","vcodec":"none","acodec":"mp4a","abr":128,"ext":"m4a","filesize":100}]}"#;

    struct BackendTestContext {
        temp: TempDir,
        state: AppState,
    }

    impl BackendTestContext {
        /// `body` becomes the stub's script. Every invocation first appends
        /// its arguments, one per line, to `args.log`.
        fn new(body: &str) -> Self {
            let temp = tempdir().unwrap();
            let args_log = temp.path().join("args.log");
            let script = format!(
                "#!/usr/bin/env bash\nprintf '%s\\n' \"$@\" >> '{}'\n{}\n",
                args_log.display(),
                body
            );
            let stub = install_ytdlp_stub(temp.path(), &script);
            let www_root = temp.path().join("www");
            fs::create_dir_all(www_root.join("assets")).unwrap();
            fs::write(www_root.join("index.html"), "<html>app</html>").unwrap();
            fs::write(www_root.join("assets/app.js"), "console.log(1)").unwrap();

            Self {
                state: AppState {
                    policy: Arc::new(ContentPolicy::default()),
                    extractor: Extractor::new(stub),
                    thumbnails: ThumbnailFetcher::new(Duration::from_secs(2)),
                    www_root: Some(Arc::new(www_root)),
                },
                temp,
            }
        }

        fn invocations(&self) -> String {
            fs::read_to_string(self.temp.path().join("args.log")).unwrap_or_default()
        }
    }

    fn install_ytdlp_stub(dir: &Path, script: &str) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        fs::write(&script_path, script).unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    /// Prints `json` for metadata calls and `payload` for stream calls.
    fn metadata_then_stream(json: &str, payload: &str) -> String {
        format!(
            "if [[ \" $* \" == *\" --dump-single-json \"* ]]; then\ncat <<'JSON'\n{json}\nJSON\nelse\nprintf '%s' '{payload}'\nfi"
        )
    }

    fn url_request(url: &str) -> ApiJson<UrlRequest> {
        ApiJson(UrlRequest {
            url: Some(url.into()),
        })
    }

    async fn error_json(err: ApiError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body.status, "ok");
    }

    #[tokio::test]
    async fn video_info_requires_url() {
        let ctx = BackendTestContext::new("exit 1");
        let err = video_info(State(ctx.state.clone()), ApiJson(UrlRequest { url: None }))
            .await
            .unwrap_err();
        let (status, body) = error_json(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["category"], "invalid_request");

        let err = video_info(State(ctx.state.clone()), url_request("   "))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn blocked_domain_never_spawns_extractor() {
        let ctx = BackendTestContext::new(&metadata_then_stream(CLIP_JSON, "x"));
        let err = video_info(
            State(ctx.state.clone()),
            url_request("https://www.PornHub.com/view_video.php?viewkey=1"),
        )
        .await
        .unwrap_err();
        let (status, body) = error_json(err).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["category"], "policy_rejected");
        assert_eq!(
            body["error"],
            "This website is not supported due to content policy restrictions."
        );
        assert!(ctx.invocations().is_empty());
    }

    #[tokio::test]
    async fn age_restricted_metadata_is_rejected() {
        let ctx = BackendTestContext::new(&metadata_then_stream(
            r#"{"id":"x","title":"Cooking","age_limit":18}"#,
            "x",
        ));
        let err = video_info(State(ctx.state.clone()), url_request("https://example.com/v"))
            .await
            .unwrap_err();
        let (status, body) = error_json(err).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Age-restricted content is not supported.");
    }

    #[tokio::test]
    async fn video_info_returns_normalized_document() {
        let ctx = BackendTestContext::new(&metadata_then_stream(CLIP_JSON, "x"));
        let Json(info) = video_info(State(ctx.state.clone()), url_request("https://example.com/v"))
            .await
            .unwrap();
        assert_eq!(info.id, "abc123");
        assert_eq!(info.channel, "Chef");
        assert_eq!(info.formats.len(), 1);
        assert_eq!(info.formats[0].format_id, "137");
        assert_eq!(info.formats[0].filesize, 1100);

        let log = ctx.invocations();
        assert!(log.contains("--dump-single-json\n"));
        assert!(log.ends_with("--\nhttps://example.com/v\n"));
    }

    #[tokio::test]
    async fn extractor_failure_is_500_with_details() {
        let ctx = BackendTestContext::new("echo 'ERROR: Unsupported URL: https://example.com/v' >&2\nexit 1");
        let err = video_info(State(ctx.state.clone()), url_request("https://example.com/v"))
            .await
            .unwrap_err();
        let (status, body) = error_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["category"], "extractor_failed");
        assert_eq!(body["error"], "Failed to fetch video information");
        assert!(body["details"].as_str().unwrap().contains("Unsupported URL"));
    }

    #[tokio::test]
    async fn download_streams_bytes_with_headers() {
        let ctx = BackendTestContext::new(&metadata_then_stream(CLIP_JSON, "VIDEOBYTES"));
        let response = download(
            State(ctx.state.clone()),
            ApiJson(DownloadRequest {
                url: Some("https://example.com/v".into()),
                format_id: Some("137".into()),
                expected_size: None,
            }),
        )
        .await
        .unwrap();

        let headers = response.headers().clone();
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(
            headers[header::CONTENT_DISPOSITION],
            "attachment; filename=\"My Clip Part 1.mp4\""
        );
        assert_eq!(headers[&X_EXPECTED_SIZE], "1100");
        assert_eq!(headers[header::CONTENT_LENGTH], "1100");
        assert_eq!(body_bytes(response).await, b"VIDEOBYTES");

        let log = ctx.invocations();
        assert!(log.contains("--format\n137+bestaudio/best\n"));
        assert!(log.contains("--merge-output-format\nmp4\n"));
    }

    #[tokio::test]
    async fn download_prefers_client_size_hint() {
        let ctx = BackendTestContext::new(&metadata_then_stream(CLIP_JSON, "VIDEOBYTES"));
        let response = download(
            State(ctx.state.clone()),
            ApiJson(DownloadRequest {
                url: Some("https://example.com/v".into()),
                format_id: Some("best".into()),
                expected_size: Some(42),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.headers()[&X_EXPECTED_SIZE], "42");
        assert!(ctx.invocations().contains("--format\nbest\n"));
    }

    #[tokio::test]
    async fn download_without_size_omits_length_headers() {
        let ctx = BackendTestContext::new(&metadata_then_stream(r#"{"title":"Bare"}"#, "DATA"));
        let response = download(
            State(ctx.state.clone()),
            ApiJson(DownloadRequest {
                url: Some("https://example.com/v".into()),
                ..DownloadRequest::default()
            }),
        )
        .await
        .unwrap();
        assert!(response.headers().get(&X_EXPECTED_SIZE).is_none());
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(body_bytes(response).await, b"DATA");
    }

    #[tokio::test]
    async fn download_failure_before_data_is_500() {
        let script = format!(
            "if [[ \" $* \" == *\" --dump-single-json \"* ]]; then\necho '{CLIP_JSON}'\nelse\necho 'ERROR: Requested format is not available' >&2\nexit 1\nfi"
        );
        let ctx = BackendTestContext::new(&script);
        let err = download(
            State(ctx.state.clone()),
            ApiJson(DownloadRequest {
                url: Some("https://example.com/v".into()),
                format_id: Some("999".into()),
                expected_size: None,
            }),
        )
        .await
        .unwrap_err();
        let (status, body) = error_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to download video");
        assert!(body["details"].as_str().unwrap().contains("not available"));
    }

    #[tokio::test]
    async fn download_checks_metadata_before_streaming() {
        let ctx = BackendTestContext::new(&metadata_then_stream(
            r#"{"title":"NSFW compilation"}"#,
            "SHOULD-NOT-STREAM",
        ));
        let err = download(
            State(ctx.state.clone()),
            ApiJson(DownloadRequest {
                url: Some("https://example.com/v".into()),
                ..DownloadRequest::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert!(!ctx.invocations().contains("--output\n"));
    }

    #[tokio::test]
    async fn thumbnail_requires_url_and_usable_image() {
        let ctx = BackendTestContext::new("exit 1");
        let err = download_thumbnail(
            State(ctx.state.clone()),
            ApiJson(ThumbnailRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = download_thumbnail(
            State(ctx.state.clone()),
            ApiJson(ThumbnailRequest {
                url: Some("file:///etc/passwd".into()),
                video_id: Some("../etc".into()),
                title: None,
            }),
        )
        .await
        .unwrap_err();
        let (status, body) = error_json(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Thumbnail not found");
    }

    #[tokio::test]
    async fn playlist_info_filters_entries() {
        let listing = r#"{"_type":"url","id":"a1","title":"Intro","playlist_id":"PL9","playlist_title":"Course","playlist_uploader":"Lecturer","thumbnails":[{"url":"https://img/a1.jpg"}]}
{"_type":"url","id":"a2","title":"Gore reel"}
{"_type":"url","id":"a3","title":"Outro","duration":30}"#;
        let ctx = BackendTestContext::new(&format!("cat <<'JSON'\n{listing}\nJSON"));
        let Json(playlist) = playlist_info(
            State(ctx.state.clone()),
            url_request("https://www.youtube.com/playlist?list=PL9"),
        )
        .await
        .unwrap();
        assert_eq!(playlist.id, "PL9");
        assert_eq!(playlist.title, "Course");
        assert_eq!(playlist.video_count, 2);
        assert_eq!(playlist.videos[1].id, "a3");
        assert_eq!(playlist.thumbnail.as_deref(), Some("https://img/a1.jpg"));
        assert!(ctx.invocations().contains("--flat-playlist\n"));
    }

    #[tokio::test]
    async fn playlist_failure_without_output_is_500() {
        let ctx = BackendTestContext::new("echo 'ERROR: playlist does not exist' >&2\nexit 1");
        let err = playlist_info(State(ctx.state.clone()), url_request("https://example.com/list"))
            .await
            .unwrap_err();
        let (status, body) = error_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["details"].as_str().unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn playlist_partial_output_is_served() {
        let ctx = BackendTestContext::new("echo '{\"id\":\"v1\",\"title\":\"One\"}'\nexit 1");
        let Json(playlist) =
            playlist_info(State(ctx.state.clone()), url_request("https://example.com/list"))
                .await
                .unwrap();
        assert_eq!(playlist.video_count, 1);
        assert_eq!(playlist.id, "playlist");
    }

    #[tokio::test]
    async fn playlist_audio_download_uses_mp3() {
        let ctx = BackendTestContext::new(&metadata_then_stream(r#"{"title":"Song"}"#, "ID3DATA"));
        let response = download_playlist_video(
            State(ctx.state.clone()),
            ApiJson(PlaylistDownloadRequest {
                url: Some("https://example.com/v".into()),
                quality: Some("audio".into()),
                filename: Some("01. My/Song?".into()),
                options: DownloadExtras {
                    subtitles: false,
                    thumbnail: true,
                    metadata: true,
                },
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"01. MySong.mp3\""
        );
        assert_eq!(body_bytes(response).await, b"ID3DATA");

        let log = ctx.invocations();
        assert!(log.contains("--extract-audio\n--audio-format\nmp3\n"));
        assert!(log.contains("--embed-thumbnail\n--add-metadata\n"));
        assert!(!log.contains("--write-sub"));
    }

    #[tokio::test]
    async fn playlist_video_download_defaults() {
        let ctx = BackendTestContext::new(&metadata_then_stream(r#"{"title":"Clip"}"#, "MP4"));
        let response = download_playlist_video(
            State(ctx.state.clone()),
            ApiJson(PlaylistDownloadRequest {
                url: Some("https://example.com/v".into()),
                ..PlaylistDownloadRequest::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"video.mp4\""
        );
        assert!(
            ctx.invocations()
                .contains("--format\nbestvideo[height<=720]+bestaudio/best\n")
        );
    }

    #[tokio::test]
    async fn json_rejections_use_api_error_body() {
        let req = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/video-info")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let Err(err) = ApiJson::<UrlRequest>::from_request(req, &()).await else {
            panic!("malformed JSON accepted");
        };
        let (status, body) = error_json(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["category"], "invalid_request");
    }

    #[tokio::test]
    async fn static_fallback_serves_spa_and_hides_api() {
        let ctx = BackendTestContext::new("exit 1");
        let root = ctx.state.www_root.clone().unwrap();

        let response = serve_www_path(&root, "/watch/abc").await.unwrap();
        assert_eq!(body_bytes(response).await, b"<html>app</html>");

        let response = serve_www_path(&root, "/assets/app.js").await.unwrap();
        assert_eq!(body_bytes(response).await, b"console.log(1)");

        assert!(serve_www_path(&root, "/assets/missing.js").await.is_err());
        assert!(resolve_www_path(&root, "/../secret").is_err());

        let req = axum::http::Request::builder()
            .uri("/api/unknown")
            .body(Body::empty())
            .unwrap();
        let response = static_fallback(State(ctx.state.clone()), req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn cors_rejects_invalid_origins() {
        assert!(cors_layer(&[]).is_ok());
        assert!(cors_layer(&["https://app.example.com".to_string()]).is_ok());
        assert!(cors_layer(&["bad\norigin".to_string()]).is_err());
    }

    #[test]
    fn cli_flags_become_overrides() {
        let args = BackendArgs::parse_from([
            "backend",
            "--port",
            "8080",
            "--extractor",
            "/opt/yt-dlp",
            "--env-file",
            "/etc/aquaseal.env",
        ]);
        let overrides = args.into_overrides();
        assert_eq!(overrides.port, Some(8080));
        assert_eq!(overrides.extractor, Some(PathBuf::from("/opt/yt-dlp")));
        assert_eq!(overrides.env_path, Some(PathBuf::from("/etc/aquaseal.env")));
        assert_eq!(overrides.host, None);
    }
}
