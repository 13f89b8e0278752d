//! gemini `generateContent` client.
//!
//! - one POST per submission, no retries, no timeout.
//! - the http layer sits behind `CompletionTransport`: `ureq` on native
//!   (run on tokio's blocking pool), `gloo-net` on wasm.
//! - replies are cleaned up the same way for every caller (`clean_reply`).

use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    /// network failure before any response arrived.
    #[error("{0}")]
    Transport(String),
    /// the endpoint answered with an error status or an error body.
    #[error("{0}")]
    Remote(String),
    /// success status, but the body is not a usable reply.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("failed to encode request: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// posts a json body and hands back status + raw body, whatever the status.
#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
pub trait CompletionTransport: Send + Sync {
    async fn post_json(&self, url: &str, body: String) -> Result<HttpResponse, CompletionError>;
}

#[cfg(not(target_arch = "wasm32"))]
#[derive(Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

#[cfg(not(target_arch = "wasm32"))]
impl Default for UreqTransport {
    fn default() -> Self {
        // error statuses carry the message we need, so keep them as responses
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent }
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait::async_trait]
impl CompletionTransport for UreqTransport {
    async fn post_json(&self, url: &str, body: String) -> Result<HttpResponse, CompletionError> {
        let agent = self.agent.clone();
        let url = url.to_string();
        // ureq is blocking; keep it off the async workers
        tokio::task::spawn_blocking(move || {
            let res = agent
                .post(&url)
                .header("Content-Type", "application/json")
                .send(body)
                .map_err(|e| CompletionError::Transport(e.to_string()))?;
            let status = res.status().as_u16();
            let body = res
                .into_body()
                .read_to_string()
                .map_err(|e| CompletionError::Transport(e.to_string()))?;
            Ok(HttpResponse { status, body })
        })
        .await
        .map_err(|e| CompletionError::Transport(e.to_string()))?
    }
}

#[cfg(target_arch = "wasm32")]
#[derive(Clone, Copy, Default)]
pub struct GlooTransport;

#[cfg(target_arch = "wasm32")]
#[async_trait::async_trait(?Send)]
impl CompletionTransport for GlooTransport {
    async fn post_json(&self, url: &str, body: String) -> Result<HttpResponse, CompletionError> {
        use gloo_net::http::Request;

        let resp = Request::post(url)
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|e| CompletionError::Transport(e.to_string()))?
            .send()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

/// the platform's default transport.
pub fn default_transport() -> Arc<dyn CompletionTransport> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        Arc::new(UreqTransport::default())
    }
    #[cfg(target_arch = "wasm32")]
    {
        Arc::new(GlooTransport)
    }
}

/// sends serialized requests to one endpoint.
#[derive(Clone)]
pub struct CompletionClient {
    endpoint: String,
    transport: Arc<dyn CompletionTransport>,
}

impl CompletionClient {
    pub fn new(endpoint: impl Into<String>, transport: Arc<dyn CompletionTransport>) -> Self {
        Self { endpoint: endpoint.into(), transport }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// posts `body` (a serialized `GenerateContentRequest`) and returns the
    /// cleaned reply text.
    pub async fn send(&self, body: String) -> Result<String, CompletionError> {
        let resp = self.transport.post_json(&self.endpoint, body).await?;
        parse_response(&resp)
    }
}

#[derive(Deserialize)]
struct ReplyBody {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ReplyPart>,
}

#[derive(Deserialize)]
struct ReplyPart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

/// maps a raw response to reply text or an error.
///
/// - non-2xx, or any body carrying an `error` object: `error.message` when
///   present, otherwise a generic message naming the status.
/// - otherwise: first candidate, first part, cleaned by `clean_reply`.
pub fn parse_response(resp: &HttpResponse) -> Result<String, CompletionError> {
    let error = serde_json::from_str::<ErrorBody>(&resp.body)
        .ok()
        .and_then(|b| b.error);
    if !resp.is_success() || error.is_some() {
        let message = error
            .and_then(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("request failed with status {}", resp.status));
        return Err(CompletionError::Remote(message));
    }

    let body: ReplyBody = serde_json::from_str(&resp.body)
        .map_err(|e| CompletionError::MalformedResponse(e.to_string()))?;
    let text = body
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .ok_or_else(|| CompletionError::MalformedResponse("no candidate text".into()))?;
    Ok(clean_reply(&text))
}

// `**` opens, the lazy group stays empty, and any trailing `*` run is eaten,
// so every run of two or more asterisks is dropped.
static BOLD_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.*?)\**").expect("static regex"));

/// strips markdown bold markers and surrounding whitespace.
pub fn clean_reply(raw: &str) -> String {
    BOLD_MARKERS.replace_all(raw, "$1").trim().to_string()
}
