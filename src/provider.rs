// Outbound provider contract: `POST <provider_url>` with `{"phone":
// ..., "text": ...}`, success iff HTTP 2xx, response body persisted
// truncated. Exposed as a trait so dispatch can be exercised without a
// network.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::model::{classify_http_status, CallOutcome};

const TRUNCATE_BODY_AT: usize = 2048;

#[derive(Debug, Serialize)]
struct ProviderRequestBody<'a> {
    phone: &'a str,
    text: &'a str,
}

#[derive(Debug, Clone)]
pub struct ProviderCallResult {
    pub outcome: CallOutcome,
    pub http_status: Option<u16>,
    pub response_body_truncated: Option<String>,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send(
        &self,
        provider_url: &str,
        phone: &str,
        text: &str,
        timeout: Duration,
    ) -> ProviderCallResult;
}

/// Production binding: a pooled `reqwest::Client`.
pub struct HttpProviderClient {
    client: reqwest::Client,
}

impl HttpProviderClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn send(
        &self,
        provider_url: &str,
        phone: &str,
        text: &str,
        timeout: Duration,
    ) -> ProviderCallResult {
        let body = ProviderRequestBody { phone, text };
        let response = self
            .client
            .post(provider_url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body_text = resp.text().await.unwrap_or_default();
                let truncated: String = body_text.chars().take(TRUNCATE_BODY_AT).collect();
                ProviderCallResult {
                    outcome: classify_http_status(status),
                    http_status: Some(status),
                    response_body_truncated: Some(truncated),
                    error_message: None,
                }
            }
            Err(e) if e.is_timeout() => ProviderCallResult {
                outcome: CallOutcome::Timeout,
                http_status: None,
                response_body_truncated: None,
                error_message: Some(e.to_string()),
            },
            Err(e) => ProviderCallResult {
                // network errors (connection refused, DNS, etc) are transient
                outcome: CallOutcome::Transient,
                http_status: None,
                response_body_truncated: None,
                error_message: Some(e.to_string()),
            },
        }
    }
}

/// Test binding: a scripted sequence of results per provider, consumed
/// in order. Exhausting the script for a provider repeats its last
/// entry so long-running tests don't panic on an empty queue.
#[derive(Default)]
pub struct MockProviderClient {
    scripts: Mutex<std::collections::HashMap<String, Vec<ProviderCallResult>>>,
}

impl MockProviderClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, provider_url: &str, result: ProviderCallResult) {
        self.scripts
            .lock()
            .await
            .entry(provider_url.to_string())
            .or_default()
            .push(result);
    }

    pub async fn always_ok(&self, provider_url: &str) {
        self.push(
            provider_url,
            ProviderCallResult {
                outcome: CallOutcome::Ok,
                http_status: Some(200),
                response_body_truncated: Some("{\"ok\":true}".to_string()),
                error_message: None,
            },
        )
        .await;
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn send(
        &self,
        provider_url: &str,
        _phone: &str,
        _text: &str,
        _timeout: Duration,
    ) -> ProviderCallResult {
        let mut scripts = self.scripts.lock().await;
        let Some(queue) = scripts.get_mut(provider_url) else {
            return ProviderCallResult {
                outcome: CallOutcome::Ok,
                http_status: Some(200),
                response_body_truncated: None,
                error_message: None,
            };
        };
        if queue.len() > 1 {
            queue.remove(0)
        } else {
            queue.last().cloned().unwrap_or(ProviderCallResult {
                outcome: CallOutcome::Ok,
                http_status: Some(200),
                response_body_truncated: None,
                error_message: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(200, CallOutcome::Ok; "2xx is ok")]
    #[test_case(500, CallOutcome::Transient; "5xx is transient")]
    #[test_case(429, CallOutcome::Transient; "429 is transient")]
    #[test_case(408, CallOutcome::Transient; "408 is transient")]
    #[test_case(404, CallOutcome::Permanent; "other 4xx is permanent")]
    #[test_case(999, CallOutcome::Transient; "unknown status is transient")]
    fn classification_matches_expected_outcome(status: u16, expected: CallOutcome) {
        assert_eq!(classify_http_status(status), expected);
    }

    #[tokio::test]
    async fn mock_client_replays_scripted_sequence_then_sticks_on_last() {
        let mock = MockProviderClient::new();
        mock.push(
            "p1",
            ProviderCallResult {
                outcome: CallOutcome::Transient,
                http_status: Some(503),
                response_body_truncated: None,
                error_message: None,
            },
        )
        .await;
        mock.always_ok("p1").await;

        let first = mock.send("p1", "+1", "hi", Duration::from_secs(1)).await;
        assert_eq!(first.outcome, CallOutcome::Transient);
        let second = mock.send("p1", "+1", "hi", Duration::from_secs(1)).await;
        assert_eq!(second.outcome, CallOutcome::Ok);
        let third = mock.send("p1", "+1", "hi", Duration::from_secs(1)).await;
        assert_eq!(third.outcome, CallOutcome::Ok);
    }
}
