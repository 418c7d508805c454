//! HTTP-клиент сервиса снимков.

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use std::{env, fmt};
use tracing::{debug, info, warn};

const HTTPS_PROXY_ENV: &str = "HTTPS_PROXY";
const JSON_CONTENT_TYPE: &str = "application/json";
const USER_AGENT: &str = concat!("hijau/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum FetchError {
    Request(reqwest::Error),
    Status { status: StatusCode, url: String },
    NoAttempts,
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(err) => write!(f, "{err}"),
            Self::Status { status, url } => write!(f, "{url} answered {status}"),
            Self::NoAttempts => f.write_str("Request attempts were not performed"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(err) => Some(err),
            Self::Status { .. } | Self::NoAttempts => None,
        }
    }
}

/// Число попыток и пауза между ними.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

/// HTTP-клиент; прокси берётся из `HTTPS_PROXY`, если переменная задана.
pub fn build_client() -> Result<Client, FetchError> {
    let mut builder = Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT);
    if let Ok(val) = env::var(HTTPS_PROXY_ENV) {
        info!(proxy = %val, "Using HTTPS proxy");
        builder = builder.proxy(reqwest::Proxy::https(val).map_err(FetchError::Request)?);
    }
    builder.build().map_err(FetchError::Request)
}

async fn send_once(client: &Client, url: &str, body: Bytes) -> Result<Bytes, FetchError> {
    let response = client
        .post(url)
        .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
        .body(body)
        .send()
        .await
        .map_err(FetchError::Request)?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            status,
            url: url.to_string(),
        });
    }
    response.bytes().await.map_err(FetchError::Request)
}

/// POST с JSON-телом; сетевые ошибки и не-2xx ответы повторяются по `policy`.
pub async fn post_json(
    client: &Client,
    url: &str,
    body: Bytes,
    policy: RetryPolicy,
) -> Result<Bytes, FetchError> {
    let mut last_error = None;
    for attempt in 1..=policy.max_retries {
        match send_once(client, url, body.clone()).await {
            Ok(content) => {
                debug!(attempt, url, bytes = content.len(), "Imagery response received");
                return Ok(content);
            }
            Err(err) => {
                warn!(attempt, url, error = %err, "HTTP request failed");
                last_error = Some(err);
            }
        }
        if attempt < policy.max_retries {
            tokio::time::sleep(policy.delay).await;
        }
    }
    Err(last_error.unwrap_or(FetchError::NoAttempts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_retries_performs_no_attempts() {
        let client = Client::new();
        let policy = RetryPolicy {
            max_retries: 0,
            delay: Duration::from_millis(1),
        };
        let result = post_json(
            &client,
            "http://127.0.0.1:9/ndvi/interval",
            Bytes::from_static(b"{}"),
            policy,
        )
        .await;
        assert!(matches!(result, Err(FetchError::NoAttempts)));
    }

    #[test]
    fn status_error_names_url() {
        let err = FetchError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            url: "http://imagery/ndvi/interval".into(),
        };
        assert_eq!(
            err.to_string(),
            "http://imagery/ndvi/interval answered 503 Service Unavailable"
        );
    }
}
