// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Remote classification over an OpenAI-compatible chat completions API

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::Classifier;
use crate::config::RemoteConfig;
use crate::credentials::CredentialStore;
use crate::model::{ClassifierSource, LabelSet, Verdict};
use crate::{Result, TidyfoldError};

/// Confidence given to an answer that named a label but no score
const BARE_LABEL_CONFIDENCE: f32 = 0.5;

/// Single-attempt remote classifier; wrap in
/// [`ResilientClassifier`](super::ResilientClassifier) for retries
pub struct RemoteClassifier {
    client: Client,
    base_url: String,
    model: String,
    service: String,
    credentials: Arc<dyn CredentialStore>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct Answer {
    label: String,
    #[serde(default)]
    confidence: Option<f32>,
}

impl RemoteClassifier {
    pub fn new(config: &RemoteConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| TidyfoldError::Config(format!("failed to create HTTP client: {}", e)))?;

        let base_url = config
            .base_url
            .trim_end_matches('/')
            .trim_end_matches("/chat/completions")
            .to_string();

        Ok(Self {
            client,
            base_url,
            model: config.model.clone(),
            service: config.service_name.clone(),
            credentials,
        })
    }

    /// Cache version string for a configured remote model
    pub fn version_for(config: &RemoteConfig) -> String {
        format!("remote:{}", config.model)
    }

    /// Service name the API key is stored under
    pub fn service(&self) -> &str {
        &self.service
    }

    fn prompt(text: &str, labels: &LabelSet) -> Vec<ChatMessage> {
        let system = format!(
            "You sort files into folders. Choose exactly one category from this list: {}. \
             If none fits, answer \"Uncategorized\". Reply with JSON only: \
             {{\"label\": \"<category>\", \"confidence\": <number between 0 and 1>}}",
            labels.labels().join(", ")
        );
        vec![
            ChatMessage { role: "system".into(), content: system },
            ChatMessage { role: "user".into(), content: text.to_string() },
        ]
    }
}

#[async_trait]
impl Classifier for RemoteClassifier {
    fn source(&self) -> ClassifierSource {
        ClassifierSource::Remote
    }

    fn version(&self) -> String {
        format!("remote:{}", self.model)
    }

    async fn classify(&self, text: &str, labels: &LabelSet) -> Result<Verdict> {
        let key = self
            .credentials
            .get(&self.service)?
            .ok_or_else(|| TidyfoldError::CredentialMissing(self.service.clone()))?;

        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: Self::prompt(text, labels),
            temperature: 0.0,
        };

        debug!("Sending classification request: model={}", self.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let bytes = response.bytes().await.map_err(classify_body_error)?;
        let body: ChatResponse = serde_json::from_slice(&bytes)
            .map_err(|e| TidyfoldError::RemoteRejected(format!("malformed response body: {}", e)))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TidyfoldError::RemoteRejected("response had no choices".into()))?;

        parse_answer(&content, labels)
    }
}

fn classify_send_error(e: reqwest::Error) -> TidyfoldError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        TidyfoldError::RemoteTransient(e.to_string())
    } else {
        TidyfoldError::Api(e)
    }
}

/// A body cut short by a timeout or a dropped connection is worth retrying
fn classify_body_error(e: reqwest::Error) -> TidyfoldError {
    if e.is_timeout() || e.is_body() || e.is_connect() {
        TidyfoldError::RemoteTransient(format!("reading response failed: {}", e))
    } else {
        TidyfoldError::RemoteRejected(format!("malformed response body: {}", e))
    }
}

fn status_error(status: StatusCode) -> TidyfoldError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        TidyfoldError::RemoteTransient(format!("service returned {}", status))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        TidyfoldError::RemoteRejected(format!("authentication failed ({})", status))
    } else {
        TidyfoldError::RemoteRejected(format!("service returned {}", status))
    }
}

/// Parse the model's reply into a verdict over `labels`
///
/// Accepts a JSON object (possibly wrapped in prose or a code fence) or a
/// bare label name. Labels outside the set become "Uncategorized" with zero
/// confidence.
pub fn parse_answer(content: &str, labels: &LabelSet) -> Result<Verdict> {
    let json = match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&content[start..=end]),
        _ => None,
    };

    let (raw_label, confidence) = match json.and_then(|j| serde_json::from_str::<Answer>(j).ok()) {
        Some(answer) => (answer.label, answer.confidence.unwrap_or(BARE_LABEL_CONFIDENCE)),
        None => {
            let bare = content.trim();
            if bare.is_empty() || bare.lines().count() > 1 {
                return Err(TidyfoldError::RemoteRejected(format!(
                    "unparseable answer: {}",
                    bare.chars().take(80).collect::<String>()
                )));
            }
            (bare.to_string(), BARE_LABEL_CONFIDENCE)
        }
    };

    let label = labels.resolve(&raw_label);
    if label == crate::model::UNCATEGORIZED {
        return Ok(Verdict::uncategorized(0.0));
    }
    Ok(Verdict::new(label, confidence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryStore;
    use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn labels() -> LabelSet {
        LabelSet::new(["Documents", "Photos"]).unwrap()
    }

    #[test]
    fn test_parse_json_answer() {
        let v = parse_answer(r#"{"label": "photos", "confidence": 0.91}"#, &labels()).unwrap();
        assert_eq!(v.label, "Photos");
        assert!((v.confidence - 0.91).abs() < 1e-6);
    }

    #[test]
    fn test_parse_fenced_answer() {
        let content = "```json\n{\"label\": \"Documents\", \"confidence\": 0.7}\n```";
        assert_eq!(parse_answer(content, &labels()).unwrap().label, "Documents");
    }

    #[test]
    fn test_parse_out_of_set_label() {
        let v = parse_answer(r#"{"label": "Recipes", "confidence": 0.99}"#, &labels()).unwrap();
        assert_eq!(v.label, crate::model::UNCATEGORIZED);
        assert_eq!(v.confidence, 0.0);
    }

    #[test]
    fn test_parse_bare_label_and_garbage() {
        assert_eq!(parse_answer("Photos", &labels()).unwrap().label, "Photos");
        assert!(parse_answer("", &labels()).is_err());
        assert!(parse_answer("I think\nmaybe photos?", &labels()).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY).is_transient());
        assert!(!status_error(StatusCode::UNAUTHORIZED).is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST).is_transient());
    }

    #[derive(Clone)]
    struct Mock {
        hits: Arc<AtomicUsize>,
        status: StatusCode,
    }

    async fn completions(
        State(mock): State<Mock>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        mock.hits.fetch_add(1, Ordering::SeqCst);
        assert_eq!(
            headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer sk-test")
        );
        assert_eq!(body["model"], "test-model");
        let reply = serde_json::json!({
            "choices": [{"message": {"role": "assistant",
                "content": "{\"label\": \"Photos\", \"confidence\": 0.88}"}}]
        });
        (mock.status, Json(reply))
    }

    async fn serve(status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(Mock { hits: hits.clone(), status });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1", addr), hits)
    }

    fn config(base_url: String) -> RemoteConfig {
        RemoteConfig {
            base_url,
            model: "test-model".into(),
            ..RemoteConfig::default()
        }
    }

    fn store_with_key() -> Arc<dyn CredentialStore> {
        let store = MemoryStore::new();
        store.set("openai", "sk-test").unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_remote_round_trip() {
        let (url, hits) = serve(StatusCode::OK).await;
        let remote = RemoteClassifier::new(&config(url), store_with_key()).unwrap();
        let verdict = remote.classify("beach vacation jpg", &labels()).await.unwrap();
        assert_eq!(verdict.label, "Photos");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(remote.version(), "remote:test-model");
    }

    #[tokio::test]
    async fn test_missing_credential_makes_no_request() {
        let (url, hits) = serve(StatusCode::OK).await;
        let remote = RemoteClassifier::new(&config(url), Arc::new(MemoryStore::new())).unwrap();
        let err = remote.classify("x", &labels()).await.unwrap_err();
        assert!(matches!(err, TidyfoldError::CredentialMissing(ref s) if s == "openai"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_response_is_transient() {
        let (url, _) = serve(StatusCode::TOO_MANY_REQUESTS).await;
        let remote = RemoteClassifier::new(&config(url), store_with_key()).unwrap();
        let err = remote.classify("x", &labels()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_stalled_body_is_transient() {
        use axum::body::{Body, Bytes};
        use std::convert::Infallible;

        // Headers arrive, the body never does
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let stalled = futures_util::stream::pending::<std::result::Result<Bytes, Infallible>>();
                (StatusCode::OK, Body::from_stream(stalled))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut cfg = config(format!("http://{}/v1", addr));
        cfg.timeout_secs = 1;
        let remote = RemoteClassifier::new(&cfg, store_with_key()).unwrap();
        let err = remote.classify("x", &labels()).await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let remote =
            RemoteClassifier::new(&config(format!("http://{}/v1", addr)), store_with_key()).unwrap();
        let err = remote.classify("x", &labels()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
