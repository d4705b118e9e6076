//! [`QuizBackend`] over the quiz service's REST API.
//!
//! Every response is wrapped in a `{status | success, message, data}`
//! envelope. Golden-hour endpoints are signed with the company credentials as
//! `X-Company-Code` / `X-Secret-Key` query parameters.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::backend::{NextQuestion, QuizBackend, QuizEndResult, SessionStart, TallyResult};
use crate::error::{QuizcastError, Result};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const GOLDEN_HOUR: &str = "/api/v1/golden_hour_quiz";

/// Company credentials for signed endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub company_code: String,
    pub secret_key: String,
}

impl ApiCredentials {
    pub fn new(company_code: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            company_code: company_code.into(),
            secret_key: secret_key.into(),
        }
    }
}

/// Configuration for [`HttpQuizBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Service root, e.g. `https://quiz.example.com`. Trailing slashes are ignored.
    pub base_url: String,
    pub credentials: Option<ApiCredentials>,
    pub timeout: Duration,
}

impl HttpBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: ApiCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    status: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default = "Option::default")]
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn is_failure(&self) -> bool {
        if self.success == Some(false) {
            return true;
        }
        matches!(
            self.status.as_ref().and_then(serde_json::Value::as_str),
            Some(s) if s.eq_ignore_ascii_case("error")
                || s.eq_ignore_ascii_case("failed")
                || s.eq_ignore_ascii_case("fail")
        )
    }
}

/// Unwrap an envelope body into its `data`.
fn decode_envelope<T: DeserializeOwned>(body: &str) -> Result<Option<T>> {
    let envelope: Envelope<T> = serde_json::from_str(body)?;
    if envelope.is_failure() {
        return Err(QuizcastError::backend(
            envelope
                .message
                .unwrap_or_else(|| "request reported failure".into()),
        ));
    }
    Ok(envelope.data)
}

fn require<T>(data: Option<T>, what: &str) -> Result<T> {
    data.ok_or_else(|| QuizcastError::backend(format!("{what}: response has no data")))
}

impl From<reqwest::Error> for QuizcastError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        Self::Backend {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

/// REST client for the quiz service.
#[derive(Debug, Clone)]
pub struct HttpQuizBackend {
    client: reqwest::Client,
    config: HttpBackendConfig,
}

impl HttpQuizBackend {
    /// # Errors
    ///
    /// Returns [`QuizcastError::Backend`] if the HTTP client cannot be built.
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpBackendConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    fn request(&self, method: Method, path: &str, signed: bool) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match (&self.config.credentials, signed) {
            (Some(creds), true) => builder.query(&[
                ("X-Company-Code", creds.company_code.as_str()),
                ("X-Secret-Key", creds.secret_key.as_str()),
            ]),
            _ => builder,
        }
    }

    async fn call<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<Option<T>> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = decode_envelope::<serde_json::Value>(&body)
                .err()
                .map(|e| e.to_string())
                .unwrap_or_else(|| status.to_string());
            return Err(QuizcastError::Backend {
                status: Some(status.as_u16()),
                message,
            });
        }
        decode_envelope(&body)
    }
}

#[async_trait]
impl QuizBackend for HttpQuizBackend {
    async fn start_session(&self, session_id: &str) -> Result<SessionStart> {
        debug!(session_id, "starting host session");
        let data = self
            .call(self.request(Method::POST, &format!("{GOLDEN_HOUR}/sessions/start/"), true))
            .await?;
        Ok(data.unwrap_or_default())
    }

    async fn start_quiz(&self, session_id: &str) -> Result<()> {
        self.call::<serde_json::Value>(self.request(
            Method::PUT,
            &format!("/quiz/start/{session_id}"),
            false,
        ))
        .await?;
        Ok(())
    }

    async fn advance_question(&self, session_id: &str) -> Result<NextQuestion> {
        let data = self
            .call(self.request(
                Method::POST,
                &format!("{GOLDEN_HOUR}/sessions/next-question/{session_id}"),
                true,
            ))
            .await?;
        require(data, "next question")
    }

    async fn start_question_time(&self, question_id: i64) -> Result<()> {
        self.call::<serde_json::Value>(self.request(
            Method::PUT,
            &format!("{GOLDEN_HOUR}/questions/start-time/{question_id}"),
            true,
        ))
        .await?;
        Ok(())
    }

    async fn elapse_question_time(&self, question_id: i64) -> Result<()> {
        self.call::<serde_json::Value>(self.request(
            Method::PUT,
            &format!("{GOLDEN_HOUR}/questions/time-elapse/{question_id}"),
            true,
        ))
        .await?;
        Ok(())
    }

    async fn question_tally(&self, question_id: i64) -> Result<TallyResult> {
        let data = self
            .call(self.request(
                Method::GET,
                &format!("{GOLDEN_HOUR}/questions/tally/{question_id}"),
                true,
            ))
            .await?;
        require(data, "question tally")
    }

    async fn end_quiz(&self, session_id: &str) -> Result<Vec<QuizEndResult>> {
        let data = self
            .call(self.request(Method::GET, &format!("/quiz/results/{session_id}"), false))
            .await?;
        Ok(data.unwrap_or_default())
    }
}
