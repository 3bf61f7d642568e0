// Artifact Retriever
//
// One retrieval attempt runs the acquisition strategies in order and keeps
// the first body that clears the byte floor. The retry loop around it lives
// with the worker that owns the event.
//
// Strategies:
// - InSessionCapture: start playback in the page and record it client-side
// - DirectFetch: GET the artifact URL with the cookies snapshotted at hand-off

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use callrelay_core::artifact::{artifact_file_name, exceeds_floor, is_audio_content_type};
use callrelay_core::{
    Artifact, ArtifactSource, Event, PipelineError, Result, RetrievalConfig, SessionSnapshot,
    SharedBrowser, SiteConfig,
};
use chrono::Utc;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

/// Fallback user agent when the session did not report one
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Everything a worker needs to fetch one event's artifact
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub row_id: String,
    pub endpoint: String,
    pub correlation_uuid: String,
    /// Direct artifact URL
    pub artifact_url: String,
    /// Page the feed lives on, sent as the referer
    pub referer: String,
    /// Cookies and user agent copied from the browser at hand-off
    pub session: SessionSnapshot,
}

impl RetrievalRequest {
    pub fn for_event(event: &Event, site: &SiteConfig, session: SessionSnapshot) -> Self {
        Self {
            row_id: event.row_id.clone(),
            endpoint: event.endpoint.clone(),
            correlation_uuid: event.correlation_uuid.clone(),
            artifact_url: site.artifact_url(&event.endpoint, &event.correlation_uuid),
            referer: site.feed_url.clone(),
            session,
        }
    }
}

/// Body returned by a strategy, before the floor check
#[derive(Debug, Clone)]
pub struct Acquired {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

// ============================================================================
// AcquisitionStrategy - One way of obtaining the artifact bytes
// ============================================================================

/// Trait for artifact acquisition strategies
///
/// Implementations can:
/// - Capture playback inside the browsing session
/// - Download over HTTP with snapshotted session cookies
#[async_trait]
pub trait AcquisitionStrategy: Send + Sync {
    fn source(&self) -> ArtifactSource;

    /// Obtain the artifact body. `ArtifactNotReady` means try again later.
    async fn acquire(&self, request: &RetrievalRequest) -> Result<Acquired>;
}

// ============================================================================
// InSessionCapture
// ============================================================================

/// Starts playback through the page's own player and records the audio
/// element into `window.recordedAudioData` as a data URL
const START_CAPTURE_SCRIPT: &str = r#"
var fnName = arguments[0], endpoint = arguments[1], uuid = arguments[2], durationMs = arguments[3];
window.recordedAudioData = null;
if (typeof window[fnName] !== 'function') return false;
try { window[fnName](endpoint, uuid); } catch (e) { return false; }
var audio = document.querySelector('audio');
if (!audio) return false;
try {
    var stream = audio.captureStream ? audio.captureStream() : audio.mozCaptureStream();
    var recorder = new MediaRecorder(stream);
    var chunks = [];
    recorder.ondataavailable = function (e) { if (e.data && e.data.size > 0) chunks.push(e.data); };
    recorder.onstop = function () {
        var reader = new FileReader();
        reader.onloadend = function () { window.recordedAudioData = reader.result; };
        reader.readAsDataURL(new Blob(chunks, { type: recorder.mimeType || 'audio/webm' }));
    };
    recorder.start();
    audio.play();
    audio.addEventListener('ended', function () { if (recorder.state !== 'inactive') recorder.stop(); });
    setTimeout(function () { if (recorder.state !== 'inactive') recorder.stop(); }, durationMs);
} catch (e) { return false; }
return true;
"#;

const COLLECT_CAPTURE_SCRIPT: &str = r#"
var data = window.recordedAudioData || null;
window.recordedAudioData = null;
return data;
"#;

/// Records playback inside the shared session
///
/// Holds the browser lock only while starting and collecting the capture;
/// the polling loop keeps running during the capture itself.
pub struct InSessionCapture {
    browser: SharedBrowser,
    playback_function: String,
    capture_duration: Duration,
    lock_wait: Duration,
}

impl InSessionCapture {
    pub fn new(browser: SharedBrowser, site: &SiteConfig, config: &RetrievalConfig) -> Self {
        Self {
            browser,
            playback_function: site.playback_function.clone(),
            capture_duration: config.capture_duration,
            lock_wait: config.request_timeout,
        }
    }
}

#[async_trait]
impl AcquisitionStrategy for InSessionCapture {
    fn source(&self) -> ArtifactSource {
        ArtifactSource::InSessionCapture
    }

    async fn acquire(&self, request: &RetrievalRequest) -> Result<Acquired> {
        let started = {
            let browser = self
                .browser
                .lock_within(self.lock_wait)
                .await
                .ok_or_else(|| PipelineError::not_ready("browser busy"))?;
            browser
                .execute_script(
                    START_CAPTURE_SCRIPT,
                    vec![
                        json!(self.playback_function),
                        json!(request.endpoint),
                        json!(request.correlation_uuid),
                        json!(self.capture_duration.as_millis() as u64),
                    ],
                )
                .await?
        };
        if !started.as_bool().unwrap_or(false) {
            return Err(PipelineError::not_ready("playback did not start"));
        }

        tokio::time::sleep(self.capture_duration).await;

        let data = {
            let browser = self
                .browser
                .lock_within(self.lock_wait)
                .await
                .ok_or_else(|| PipelineError::not_ready("browser busy"))?;
            browser.execute_script(COLLECT_CAPTURE_SCRIPT, vec![]).await?
        };
        match data {
            Value::String(url) => decode_data_url(&url),
            _ => Err(PipelineError::not_ready("no captured audio")),
        }
    }
}

/// Decode a `data:<type>;base64,<payload>` URL
pub fn decode_data_url(url: &str) -> Result<Acquired> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| PipelineError::fetch("captured data is not a data URL"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| PipelineError::fetch("captured data URL has no payload"))?;
    let meta = meta
        .strip_suffix(";base64")
        .ok_or_else(|| PipelineError::fetch("captured data URL is not base64"))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| PipelineError::fetch(format!("captured data: {}", e)))?;
    let content_type = meta.split(';').next().filter(|t| !t.is_empty());

    Ok(Acquired {
        bytes,
        content_type: content_type.map(str::to_string),
    })
}

// ============================================================================
// DirectFetch
// ============================================================================

/// Downloads the artifact URL with the session's cookies and browser headers
pub struct DirectFetch {
    client: Client,
    timeout: Duration,
}

impl DirectFetch {
    pub fn new(config: &RetrievalConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| PipelineError::config(format!("download client: {}", e)))?;
        Ok(Self::with_client(client, config.request_timeout))
    }

    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn headers(request: &RetrievalRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let user_agent = request
            .session
            .user_agent
            .as_deref()
            .unwrap_or(DEFAULT_USER_AGENT);
        let pairs = [
            (header::USER_AGENT, user_agent.to_string()),
            (header::REFERER, request.referer.clone()),
            (header::ACCEPT, "audio/mpeg, audio/*, */*".to_string()),
            (header::ACCEPT_LANGUAGE, "en-US,en;q=0.9".to_string()),
            (header::RANGE, "bytes=0-".to_string()),
            (header::HeaderName::from_static("sec-fetch-dest"), "audio".to_string()),
            (header::HeaderName::from_static("sec-fetch-mode"), "no-cors".to_string()),
            (header::HeaderName::from_static("sec-fetch-site"), "same-origin".to_string()),
        ];
        for (name, value) in pairs {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
        if let Some(cookies) = request.session.cookie_header() {
            if let Ok(value) = HeaderValue::from_str(&cookies) {
                headers.insert(header::COOKIE, value);
            }
        }
        headers
    }
}

#[async_trait]
impl AcquisitionStrategy for DirectFetch {
    fn source(&self) -> ArtifactSource {
        ArtifactSource::DirectFetch
    }

    async fn acquire(&self, request: &RetrievalRequest) -> Result<Acquired> {
        let response = self
            .client
            .get(&request.artifact_url)
            .headers(Self::headers(request))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PipelineError::fetch(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PipelineError::not_ready("artifact URL returned 404"));
        }
        if !status.is_success() {
            return Err(PipelineError::fetch(format!("artifact URL returned {}", status)));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !is_audio_content_type(content_type.as_deref()) {
            return Err(PipelineError::fetch(format!(
                "unexpected content type {}",
                content_type.unwrap_or_default()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::fetch(e.to_string()))?;
        Ok(Acquired {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

// ============================================================================
// ArtifactRetriever
// ============================================================================

/// Runs the acquisition strategies for one attempt
pub struct ArtifactRetriever {
    strategies: Vec<Box<dyn AcquisitionStrategy>>,
    min_bytes: u64,
    download_folder: PathBuf,
}

impl ArtifactRetriever {
    pub fn new(strategies: Vec<Box<dyn AcquisitionStrategy>>, config: &RetrievalConfig) -> Self {
        Self {
            strategies,
            min_bytes: config.min_artifact_bytes,
            download_folder: config.download_folder.clone(),
        }
    }

    /// In-session capture (when enabled) followed by direct fetch
    pub fn standard(browser: SharedBrowser, site: &SiteConfig, config: &RetrievalConfig) -> Result<Self> {
        let mut strategies: Vec<Box<dyn AcquisitionStrategy>> = Vec::new();
        if config.in_session_capture {
            strategies.push(Box::new(InSessionCapture::new(browser, site, config)));
        }
        strategies.push(Box::new(DirectFetch::new(config)?));
        Ok(Self::new(strategies, config))
    }

    /// One retrieval attempt. The artifact is written to the download folder
    /// before it is returned.
    ///
    /// Errors that are retryable (`ArtifactNotReady`, `ArtifactTooSmall`,
    /// `ArtifactFetch`, `Browser`) mean "try again after the retry delay";
    /// anything else is a genuine failure.
    #[instrument(skip(self, request), fields(row_id = %request.row_id))]
    pub async fn retrieve(&self, request: &RetrievalRequest) -> Result<Artifact> {
        let mut last_error = PipelineError::not_ready("no acquisition strategy");

        for strategy in &self.strategies {
            let source = strategy.source();
            let acquired = match strategy.acquire(request).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    debug!(%source, error = %e, "Strategy produced no artifact");
                    last_error = e;
                    continue;
                }
            };

            let size = acquired.bytes.len() as u64;
            if !exceeds_floor(size, self.min_bytes) {
                debug!(%source, size, floor = self.min_bytes, "Artifact too small");
                last_error = PipelineError::ArtifactTooSmall {
                    size,
                    floor: self.min_bytes,
                };
                continue;
            }

            let artifact = self.store(request, acquired, source).await?;
            info!(%source, size, path = %artifact.path.display(), "Artifact retrieved");
            return Ok(artifact);
        }

        Err(last_error)
    }

    async fn store(&self, request: &RetrievalRequest, acquired: Acquired, source: ArtifactSource) -> Result<Artifact> {
        let extension = match acquired.content_type.as_deref() {
            Some(t) if t.contains("webm") => "webm",
            Some(t) if t.contains("ogg") => "ogg",
            Some(t) if t.contains("wav") => "wav",
            _ => "mp3",
        };
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let path = self
            .download_folder
            .join(artifact_file_name(&request.endpoint, &stamp, extension));

        tokio::fs::create_dir_all(&self.download_folder).await?;
        tokio::fs::write(&path, &acquired.bytes).await?;

        Ok(Artifact {
            path,
            bytes: acquired.bytes,
            content_type: acquired.content_type,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callrelay_core::memory::ScriptedBrowser;
    use callrelay_core::BrowserCookie;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn temp_folder() -> PathBuf {
        std::env::temp_dir().join(format!("callrelay-retriever-{}", uuid::Uuid::now_v7()))
    }

    fn request(server_uri: &str) -> RetrievalRequest {
        let site = SiteConfig::default().with_base_url(server_uri);
        let event = Event::detect(
            callrelay_core::FeedRow::new("call_77", "15551234567"),
            None,
            Utc::now(),
        );
        let session = SessionSnapshot::new(
            vec![BrowserCookie::new("PHPSESSID", "abc"), BrowserCookie::new("lang", "en")],
            Some("TestAgent/1.0".to_string()),
        );
        RetrievalRequest::for_event(&event, &site, session)
    }

    fn config(folder: &PathBuf) -> RetrievalConfig {
        RetrievalConfig::default()
            .with_min_artifact_bytes(1000)
            .with_download_folder(folder.clone())
    }

    async fn serve_audio(server: &MockServer, size: usize) {
        Mock::given(method("GET"))
            .and(path("/live/calls/sound"))
            .and(query_param("did", "15551234567"))
            .and(query_param("uuid", "call_77"))
            .and(header("cookie", "PHPSESSID=abc; lang=en"))
            .and(header("user-agent", "TestAgent/1.0"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/mpeg")
                    .set_body_bytes(vec![1u8; size]),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_direct_fetch_writes_file() {
        let server = MockServer::start().await;
        serve_audio(&server, 4096).await;
        let folder = temp_folder();
        let config = config(&folder);

        let retriever = ArtifactRetriever::new(vec![Box::new(DirectFetch::new(&config).unwrap())], &config);
        let artifact = retriever.retrieve(&request(&server.uri())).await.unwrap();

        assert_eq!(artifact.size(), 4096);
        assert_eq!(artifact.source, ArtifactSource::DirectFetch);
        assert!(artifact.file_name().starts_with("call_5551234567_"));
        assert!(artifact.file_name().ends_with(".mp3"));
        assert_eq!(tokio::fs::read(&artifact.path).await.unwrap().len(), 4096);

        let _ = tokio::fs::remove_dir_all(&folder).await;
    }

    #[tokio::test]
    async fn test_floor_is_strict() {
        let folder = temp_folder();
        let config = config(&folder);

        let server = MockServer::start().await;
        serve_audio(&server, 1000).await;
        let retriever = ArtifactRetriever::new(vec![Box::new(DirectFetch::new(&config).unwrap())], &config);
        assert!(matches!(
            retriever.retrieve(&request(&server.uri())).await,
            Err(PipelineError::ArtifactTooSmall { size: 1000, floor: 1000 })
        ));

        let server = MockServer::start().await;
        serve_audio(&server, 1001).await;
        assert_eq!(retriever.retrieve(&request(&server.uri())).await.unwrap().size(), 1001);

        let _ = tokio::fs::remove_dir_all(&folder).await;
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let folder = temp_folder();
        let config = config(&folder);

        let retriever = ArtifactRetriever::new(vec![Box::new(DirectFetch::new(&config).unwrap())], &config);
        let err = retriever.retrieve(&request(&server.uri())).await.unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactNotReady(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_html_body_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string("<html>".repeat(500)),
            )
            .mount(&server)
            .await;
        let folder = temp_folder();
        let config = config(&folder);

        let retriever = ArtifactRetriever::new(vec![Box::new(DirectFetch::new(&config).unwrap())], &config);
        assert!(matches!(
            retriever.retrieve(&request(&server.uri())).await,
            Err(PipelineError::ArtifactFetch(_))
        ));
    }

    #[test]
    fn test_decode_data_url() {
        let acquired = decode_data_url("data:audio/webm;codecs=opus;base64,AAECAw==").unwrap();
        assert_eq!(acquired.bytes, vec![0, 1, 2, 3]);
        assert_eq!(acquired.content_type.as_deref(), Some("audio/webm"));

        assert!(decode_data_url("blob:https://x/1").is_err());
        assert!(decode_data_url("data:audio/webm,plain").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_session_capture_releases_lock_while_recording() {
        let payload = base64::engine::general_purpose::STANDARD.encode(vec![9u8; 2000]);
        let browser = ScriptedBrowser::new()
            .reply_to("new MediaRecorder", json!(true))
            .reply_to("var data = window.recordedAudioData", json!(format!("data:audio/webm;base64,{}", payload)));
        let shared = SharedBrowser::new(Arc::new(browser.clone()));
        let folder = temp_folder();
        let config = config(&folder);

        let capture = InSessionCapture::new(shared.clone(), &SiteConfig::default(), &config);
        let task = tokio::spawn(async move {
            let req = RetrievalRequest {
                row_id: "call_1".to_string(),
                endpoint: "15551234567".to_string(),
                correlation_uuid: "call_1".to_string(),
                artifact_url: String::new(),
                referer: String::new(),
                session: SessionSnapshot::new(vec![], None),
            };
            capture.acquire(&req).await
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(shared.lock_within(Duration::from_millis(10)).await.is_some());

        let acquired = task.await.unwrap().unwrap();
        assert_eq!(acquired.bytes.len(), 2000);
        assert_eq!(acquired.content_type.as_deref(), Some("audio/webm"));
        assert_eq!(browser.script_count("recordedAudioData"), 2);
    }

    #[tokio::test]
    async fn test_capture_without_player_is_not_ready() {
        let browser = ScriptedBrowser::new();
        let folder = temp_folder();
        let config = config(&folder);
        let capture = InSessionCapture::new(
            SharedBrowser::new(Arc::new(browser)),
            &SiteConfig::default(),
            &config,
        );

        let err = capture.acquire(&request("http://127.0.0.1:1")).await.unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactNotReady(_)));
    }
}
