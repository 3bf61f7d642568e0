// WebDriver Session Implementation
//
// Implements the BrowserSession trait from callrelay-core over the W3C
// WebDriver HTTP protocol. Works against chromedriver, geckodriver or a
// selenium server.

use async_trait::async_trait;
use base64::Engine;
use callrelay_core::{BrowserCookie, BrowserSession, PipelineError, WebDriverConfig};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

/// WebDriver errors
#[derive(Debug, thiserror::Error)]
pub enum WebDriverError {
    /// Transport failure talking to the driver
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The driver answered with a WebDriver error object
    #[error("{error} ({status}): {message}")]
    Command {
        status: u16,
        error: String,
        message: String,
    },

    /// The driver answered with something that is not a WebDriver response
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl From<WebDriverError> for PipelineError {
    fn from(e: WebDriverError) -> Self {
        PipelineError::Browser(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Script returning the outer markup of every element matching arguments[0]
const OUTER_MARKUP_SCRIPT: &str =
    "return Array.from(document.querySelectorAll(arguments[0])).map(function (e) { return e.outerHTML; });";

/// A live WebDriver session
pub struct WebDriverSession {
    client: Client,
    endpoint: String,
    session_id: String,
}

impl WebDriverSession {
    /// Start a new browser session on the driver at `config.endpoint`
    #[instrument(skip(config), fields(endpoint = %config.endpoint))]
    pub async fn connect(config: &WebDriverConfig) -> Result<Self, WebDriverError> {
        let client = Client::builder().timeout(config.command_timeout).build()?;
        let endpoint = config.endpoint.trim_end_matches('/').to_string();

        let response = client
            .post(format!("{}/session", endpoint))
            .json(&Self::capabilities(config))
            .send()
            .await?;
        let value = Self::read_value(response).await?;
        let session: NewSession = serde_json::from_value(value)
            .map_err(|e| WebDriverError::Protocol(format!("new session: {}", e)))?;

        info!(session_id = %session.session_id, browser = %config.browser_name, "WebDriver session started");

        Ok(Self {
            client,
            endpoint,
            session_id: session.session_id,
        })
    }

    /// Attach to an existing session
    pub fn attach(client: Client, endpoint: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// End the session and close the browser
    pub async fn quit(&self) -> Result<(), WebDriverError> {
        let url = format!("{}/session/{}", self.endpoint, self.session_id);
        let response = self.client.delete(url).send().await?;
        Self::read_value(response).await?;
        debug!(session_id = %self.session_id, "WebDriver session closed");
        Ok(())
    }

    fn capabilities(config: &WebDriverConfig) -> Value {
        let mut args = config.args.clone();
        if config.headless {
            args.push("--headless=new".to_string());
        }
        if let Some(user_agent) = &config.user_agent {
            args.push(format!("--user-agent={}", user_agent));
        }

        let mut always_match = json!({ "browserName": config.browser_name });
        match config.browser_name.as_str() {
            "firefox" => {
                always_match["moz:firefoxOptions"] = json!({ "args": args });
            }
            _ => {
                always_match["goog:chromeOptions"] = json!({
                    "args": args,
                    "excludeSwitches": ["enable-automation"],
                });
            }
        }

        json!({ "capabilities": { "alwaysMatch": always_match } })
    }

    async fn read_value(response: reqwest::Response) -> Result<Value, WebDriverError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let parsed = serde_json::from_str::<WireResponse>(&body)
                .ok()
                .and_then(|r| serde_json::from_value::<WireError>(r.value).ok());
            return Err(match parsed {
                Some(err) => WebDriverError::Command {
                    status: status.as_u16(),
                    error: err.error,
                    message: err.message,
                },
                None => WebDriverError::Command {
                    status: status.as_u16(),
                    error: "unknown error".to_string(),
                    message: body,
                },
            });
        }

        let parsed: WireResponse = serde_json::from_str(&body)
            .map_err(|e| WebDriverError::Protocol(format!("{}: {}", e, body)))?;
        Ok(parsed.value)
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, WebDriverError> {
        let url = format!("{}/session/{}{}", self.endpoint, self.session_id, path);
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        Self::read_value(response).await
    }

    fn expect_string(value: Value, what: &str) -> Result<String, WebDriverError> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(WebDriverError::Protocol(format!(
                "{} was not a string: {}",
                what, other
            ))),
        }
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn navigate(&self, url: &str) -> callrelay_core::Result<()> {
        debug!(%url, "Navigating");
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    async fn current_url(&self) -> callrelay_core::Result<String> {
        let value = self.command(Method::GET, "/url", None).await?;
        Ok(Self::expect_string(value, "url")?)
    }

    async fn title(&self) -> callrelay_core::Result<String> {
        let value = self.command(Method::GET, "/title", None).await?;
        Ok(Self::expect_string(value, "title")?)
    }

    async fn page_source(&self) -> callrelay_core::Result<String> {
        let value = self.command(Method::GET, "/source", None).await?;
        Ok(Self::expect_string(value, "page source")?)
    }

    async fn page_markup(&self, selector: &str) -> callrelay_core::Result<Vec<String>> {
        let value = self
            .execute_script(OUTER_MARKUP_SCRIPT, vec![json!(selector)])
            .await?;
        match value {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()),
            Value::Null => Ok(vec![]),
            other => Err(PipelineError::browser(format!(
                "markup for {} was not a list: {}",
                selector, other
            ))),
        }
    }

    async fn execute_script(&self, script: &str, args: Vec<Value>) -> callrelay_core::Result<Value> {
        let value = self
            .command(
                Method::POST,
                "/execute/sync",
                Some(json!({ "script": script, "args": args })),
            )
            .await?;
        Ok(value)
    }

    async fn cookies(&self) -> callrelay_core::Result<Vec<BrowserCookie>> {
        let value = self.command(Method::GET, "/cookie", None).await?;
        serde_json::from_value(value)
            .map_err(|e| PipelineError::browser(format!("malformed cookies: {}", e)))
    }

    async fn set_cookie(&self, cookie: BrowserCookie) -> callrelay_core::Result<()> {
        self.command(Method::POST, "/cookie", Some(json!({ "cookie": cookie })))
            .await?;
        Ok(())
    }

    async fn screenshot(&self) -> callrelay_core::Result<Vec<u8>> {
        let value = self.command(Method::GET, "/screenshot", None).await?;
        let encoded = Self::expect_string(value, "screenshot")?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| PipelineError::browser(format!("screenshot decode: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn session(server: &MockServer) -> WebDriverSession {
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "abc123", "capabilities": {} }
            })))
            .mount(server)
            .await;

        let config = WebDriverConfig::default().with_endpoint(server.uri());
        WebDriverSession::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_reads_session_id() {
        let server = MockServer::start().await;
        let session = session(&server).await;
        assert_eq!(session.session_id(), "abc123");
    }

    #[tokio::test]
    async fn test_capabilities_include_user_agent_and_headless() {
        let config = WebDriverConfig::default()
            .with_user_agent("Agent/1.0")
            .with_headless(true);
        let caps = WebDriverSession::capabilities(&config);
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(args.contains(&json!("--headless=new")));
        assert!(args.contains(&json!("--user-agent=Agent/1.0")));
    }

    #[tokio::test]
    async fn test_navigate_and_title() {
        let server = MockServer::start().await;
        let session = session(&server).await;

        Mock::given(method("POST"))
            .and(path("/session/abc123/url"))
            .and(body_partial_json(json!({ "url": "https://feed.test/live" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/abc123/title"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": "Live Calls" })))
            .mount(&server)
            .await;

        session.navigate("https://feed.test/live").await.unwrap();
        assert_eq!(session.title().await.unwrap(), "Live Calls");
    }

    #[tokio::test]
    async fn test_page_markup_uses_script() {
        let server = MockServer::start().await;
        let session = session(&server).await;

        Mock::given(method("POST"))
            .and(path("/session/abc123/execute/sync"))
            .and(body_partial_json(json!({ "args": ["#LiveCalls tr"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": ["<tr id=\"call_1\"></tr>", "<tr id=\"call_2\"></tr>"]
            })))
            .mount(&server)
            .await;

        let markup = session.page_markup("#LiveCalls tr").await.unwrap();
        assert_eq!(markup.len(), 2);
    }

    #[tokio::test]
    async fn test_command_error_is_mapped() {
        let server = MockServer::start().await;
        let session = session(&server).await;

        Mock::given(method("GET"))
            .and(path("/session/abc123/url"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "value": { "error": "invalid session id", "message": "session deleted" }
            })))
            .mount(&server)
            .await;

        let err = session.current_url().await.unwrap_err();
        assert!(matches!(err, PipelineError::Browser(_)));
        assert!(err.to_string().contains("invalid session id"));
    }

    #[tokio::test]
    async fn test_cookies_and_screenshot() {
        let server = MockServer::start().await;
        let session = session(&server).await;

        Mock::given(method("GET"))
            .and(path("/session/abc123/cookie"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    { "name": "session", "value": "xyz", "domain": "feed.test", "path": "/", "httpOnly": true }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/abc123/screenshot"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": "iVBORw0K" })))
            .mount(&server)
            .await;

        let cookies = session.cookies().await.unwrap();
        assert_eq!(cookies, vec![BrowserCookie {
            name: "session".to_string(),
            value: "xyz".to_string(),
            domain: Some("feed.test".to_string()),
            path: Some("/".to_string()),
        }]);

        let png = session.screenshot().await.unwrap();
        assert_eq!(&png[..4], b"\x89PNG");
    }
}
