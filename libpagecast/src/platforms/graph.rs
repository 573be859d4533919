//! Thin Meta Graph API client and error classification

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::config::GraphConfig;
use crate::error::{PlatformError, Result};
use crate::types::{FailureKind, PublishFailure};

/// The `error` object of a Graph API error response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphApiError {
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub error_subcode: Option<i64>,
    #[serde(default)]
    pub is_transient: bool,
    #[serde(default)]
    pub error_user_msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: GraphApiError,
}

const RATE_LIMIT_CODES: &[i64] = &[4, 17, 32, 613];
const RATE_LIMIT_SUBCODES: &[i64] = &[2446079];
const INVALID_MEDIA_CODES: &[i64] = &[9004, 2207026, 36003];
const MEDIA_PROCESSING_CODES: &[i64] = &[9007, 2207027];

/// Map a failed Graph API call to a [`PublishFailure`].
///
/// The error code wins when present; otherwise the HTTP status decides and
/// anything unrecognised is an unknown (retryable) failure.
pub fn classify(status: StatusCode, error: Option<&GraphApiError>) -> PublishFailure {
    let message = match error {
        Some(e) => {
            let text = e.error_user_msg.as_deref().unwrap_or(&e.message);
            match e.code {
                Some(code) => format!("(#{}) {}", code, text),
                None => text.to_string(),
            }
        }
        None => format!("HTTP {}", status.as_u16()),
    };

    if let Some(kind) = error.and_then(kind_from_error) {
        return PublishFailure::new(kind, message);
    }

    let kind = if status == StatusCode::TOO_MANY_REQUESTS {
        FailureKind::RateLimited
    } else if status.is_server_error() {
        FailureKind::PlatformUnavailable
    } else {
        FailureKind::Unknown
    };
    PublishFailure::new(kind, message)
}

fn kind_from_error(e: &GraphApiError) -> Option<FailureKind> {
    let code = e.code.unwrap_or_default();
    let subcode = e.error_subcode.unwrap_or_default();
    let matches = |set: &[i64]| set.contains(&code) || set.contains(&subcode);

    if RATE_LIMIT_CODES.contains(&code) || RATE_LIMIT_SUBCODES.contains(&subcode) {
        return Some(FailureKind::RateLimited);
    }
    if matches(INVALID_MEDIA_CODES) {
        return Some(FailureKind::InvalidMedia);
    }
    if matches(MEDIA_PROCESSING_CODES) {
        return Some(FailureKind::MediaProcessing);
    }
    if matches!(code, 1 | 2) || e.is_transient {
        return Some(FailureKind::PlatformUnavailable);
    }

    match code {
        190 | 102 | 10 | 200..=299 => Some(FailureKind::PermissionDenied),
        3 => Some(FailureKind::AccountNotConnected),
        368 => Some(FailureKind::PolicyViolation),
        100 => Some(FailureKind::InvalidRequest),
        _ => None,
    }
}

/// Map a transport error (no HTTP response) to a retryable network failure
pub fn classify_transport(err: &reqwest::Error) -> PublishFailure {
    let detail = if err.is_timeout() {
        "request timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    PublishFailure::new(FailureKind::Network, format!("{}: {}", detail, err))
}

#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: String,
    api_version: String,
}

impl GraphClient {
    pub fn new(config: &GraphConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("pagecast/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Setup(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            self.api_version,
            path.trim_start_matches('/')
        )
    }

    pub async fn get(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> std::result::Result<Value, PublishFailure> {
        let request = self.http.get(self.url(path)).query(params);
        self.execute(path, request).await
    }

    pub async fn post(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> std::result::Result<Value, PublishFailure> {
        let request = self.http.post(self.url(path)).form(params);
        self.execute(path, request).await
    }

    async fn execute(
        &self,
        path: &str,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<Value, PublishFailure> {
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| classify_transport(&e))?;

        let parsed: Option<Value> = serde_json::from_str(&body).ok();
        let api_error = parsed
            .as_ref()
            .and_then(|v| serde_json::from_value::<ErrorEnvelope>(v.clone()).ok())
            .map(|env| env.error);

        match (status.is_success(), api_error, parsed) {
            (true, None, Some(value)) => Ok(value),
            (true, None, None) => Err(PublishFailure::new(
                FailureKind::Unknown,
                format!("unparseable response from {}", path),
            )),
            (_, api_error, _) => {
                let failure = classify(status, api_error.as_ref());
                tracing::debug!(
                    path = %path,
                    status = status.as_u16(),
                    kind = %failure.kind,
                    "Graph API call failed"
                );
                Err(failure)
            }
        }
    }
}

/// Read a string id field from a Graph response
pub fn id_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
