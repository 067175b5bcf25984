//! Outbound HTTP with classification, exponential backoff and an optional
//! reachability probe. Every external service call goes through here.

use crate::core::config::RetryConfig;
use crate::core::error::{ClientError, ErrorKind, Service};
use log::{debug, warn};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const BODY_SNIPPET: usize = 300;

/// Result of one network attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome<T> {
    Success(T),
    Transient(String),
    RateLimited(Option<Duration>),
    Fatal(String),
}

/// An attempt that did not produce a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    Transient(String),
    RateLimited(Option<Duration>),
    Fatal(String),
}

impl<T> From<Failure> for AttemptOutcome<T> {
    fn from(f: Failure) -> Self {
        match f {
            Failure::Transient(r) => AttemptOutcome::Transient(r),
            Failure::RateLimited(h) => AttemptOutcome::RateLimited(h),
            Failure::Fatal(r) => AttemptOutcome::Fatal(r),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_wait: Duration,
    pub max_wait: Duration,
    pub multiplier: u32,
    pub timeout: Duration,
    /// Probed once before the first attempt; unreachable means fail without retrying.
    pub preflight_url: Option<String>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_wait,
            max_wait,
            multiplier: 2,
            timeout: Duration::from_secs(60),
            preflight_url: None,
        }
    }

    pub fn with_preflight(mut self, url: impl Into<String>) -> Self {
        self.preflight_url = Some(url.into());
        self
    }
}

fn secs(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        let mut policy = RetryPolicy::new(
            cfg.max_attempts,
            secs(cfg.initial_wait_secs, Duration::from_millis(500)),
            secs(cfg.max_wait_secs, Duration::from_secs(32)),
        );
        policy.timeout = Duration::from_secs(cfg.timeout_secs.max(1));
        policy
    }
}

/// Wait schedule for one call. Not shared between calls.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: u32,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            initial: policy.initial_wait,
            max: policy.max_wait,
            multiplier: policy.multiplier.max(1),
            current: None,
        }
    }

    /// initial × multiplier^n, capped.
    pub fn on_transient(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(c) => c.saturating_mul(self.multiplier),
        }
        .min(self.max);
        self.current = Some(next);
        next
    }

    /// 4 × current, capped. A server hint only ever lengthens the wait.
    pub fn on_rate_limited(&mut self, hint: Option<Duration>) -> Duration {
        let base = self.current.unwrap_or(self.initial);
        let mut next = base.saturating_mul(4).min(self.max);
        if let Some(h) = hint {
            next = next.max(h.min(self.max));
        }
        self.current = Some(next);
        next
    }
}

pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Failure {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Failure::RateLimited(retry_after)
    } else if status.is_server_error() {
        Failure::Transient(format!("HTTP {}: {}", status, snippet(body)))
    } else {
        Failure::Fatal(format!("HTTP {}: {}", status, snippet(body)))
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> Failure {
    if err.is_timeout() {
        Failure::Transient(format!("timed out: {}", err))
    } else if err.is_connect() {
        Failure::Transient(format!("connection failed: {}", err))
    } else if err.is_builder() {
        Failure::Fatal(err.to_string())
    } else {
        Failure::Transient(err.to_string())
    }
}

/// A body that stops short means the connection dropped, whatever reqwest calls it.
fn body_read_failure(err: &reqwest::Error) -> Failure {
    Failure::Transient(format!("response body interrupted: {}", err))
}

pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= BODY_SNIPPET {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(BODY_SNIPPET).collect();
        format!("{}…", cut)
    }
}

/// Runs `attempt` until it succeeds, fails fatally, or `max_attempts` is used up.
pub async fn execute_with_retry<T, F, Fut>(
    service: Service,
    policy: &RetryPolicy,
    request_echo: &str,
    mut attempt: F,
) -> Result<T, ClientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = AttemptOutcome<T>>,
{
    let mut backoff = Backoff::new(policy);
    let mut last_kind = ErrorKind::TransientNetwork;
    let mut last_error = String::new();

    for n in 1..=policy.max_attempts {
        debug!("{} attempt {}/{}", service, n, policy.max_attempts);
        let wait = match attempt(n).await {
            AttemptOutcome::Success(value) => return Ok(value),
            AttemptOutcome::Fatal(reason) => {
                return Err(ClientError::Fatal {
                    service,
                    attempts: n,
                    reason,
                    request: request_echo.to_string(),
                });
            }
            AttemptOutcome::Transient(reason) => {
                last_kind = ErrorKind::TransientNetwork;
                last_error = reason;
                backoff.on_transient()
            }
            AttemptOutcome::RateLimited(hint) => {
                last_kind = ErrorKind::RateLimited;
                last_error = match hint {
                    Some(h) => format!("HTTP 429 (retry after {}s)", h.as_secs()),
                    None => "HTTP 429".to_string(),
                };
                backoff.on_rate_limited(hint)
            }
        };

        if n < policy.max_attempts {
            warn!(
                "{} attempt {}/{} failed ({}: {}), retrying in {:.1}s",
                service,
                n,
                policy.max_attempts,
                last_kind,
                last_error,
                wait.as_secs_f64()
            );
            tokio::time::sleep(wait).await;
        }
    }

    Err(ClientError::Exhausted {
        service,
        attempts: policy.max_attempts,
        last_kind,
        last_error,
    })
}

/// HTTP client bound to one service and its retry policy.
#[derive(Clone)]
pub struct ResilientClient {
    http: reqwest::Client,
    service: Service,
    policy: RetryPolicy,
}

impl ResilientClient {
    pub fn new(service: Service, policy: RetryPolicy) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(policy.timeout).build()?;
        Ok(Self {
            http,
            service,
            policy,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Cheap liveness check. Any HTTP answer counts as alive.
    pub async fn probe(&self, url: &str) -> Result<(), ClientError> {
        match self.http.get(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => {
                debug!("{} probe answered {}", self.service, resp.status());
                Ok(())
            }
            Err(e) => Err(ClientError::Unreachable {
                service: self.service,
                reason: e.to_string(),
            }),
        }
    }

    async fn send_once<B>(&self, build: &B) -> Result<Vec<u8>, Failure>
    where
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let resp = build(&self.http)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let body = resp.text().await.map_err(|e| body_read_failure(&e))?;
            return Err(classify_status(status, retry_after, &body));
        }
        let bytes = resp.bytes().await.map_err(|e| body_read_failure(&e))?;
        Ok(bytes.to_vec())
    }

    /// One attempt whose JSON body is handed to `extract`; an `Err` from
    /// `extract` means the expected payload is missing and is fatal.
    pub async fn attempt_json<T, B, E>(&self, build: &B, extract: &E) -> AttemptOutcome<T>
    where
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
        E: Fn(Value) -> Result<T, String>,
    {
        let bytes = match self.send_once(build).await {
            Ok(b) => b,
            Err(f) => return f.into(),
        };
        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                return AttemptOutcome::Fatal(format!(
                    "malformed JSON response ({}): {}",
                    e,
                    snippet(&String::from_utf8_lossy(&bytes))
                ))
            }
        };
        match extract(value) {
            Ok(payload) => AttemptOutcome::Success(payload),
            Err(reason) => AttemptOutcome::Fatal(reason),
        }
    }

    pub async fn execute_json<T, B, E>(
        &self,
        request_echo: &str,
        build: B,
        extract: E,
    ) -> Result<T, ClientError>
    where
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
        E: Fn(Value) -> Result<T, String>,
    {
        if let Some(url) = &self.policy.preflight_url {
            self.probe(url).await?;
        }
        let (build, extract) = (&build, &extract);
        execute_with_retry(self.service, &self.policy, request_echo, move |_| {
            self.attempt_json(build, extract)
        })
        .await
    }

    /// GET raw bytes with the same retry discipline.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let build = |http: &reqwest::Client| http.get(url);
        let build = &build;
        execute_with_retry(self.service, &self.policy, url, move |_| async move {
            match self.send_once(build).await {
                Ok(bytes) if bytes.is_empty() => {
                    AttemptOutcome::Fatal("empty body".to_string())
                }
                Ok(bytes) => AttemptOutcome::Success(bytes),
                Err(f) => f.into(),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_transient_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(32));
        let mut backoff = Backoff::new(&policy);
        let waits: Vec<f64> = (0..9).map(|_| backoff.on_transient().as_secs_f64()).collect();
        assert_eq!(waits, vec![0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 32.0, 32.0]);
    }

    #[test]
    fn test_rate_limited_backoff_is_four_times_current() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(32));
        let mut backoff = Backoff::new(&policy);
        assert_eq!(backoff.on_transient(), Duration::from_millis(500));
        assert_eq!(backoff.on_transient(), Duration::from_secs(1));
        assert_eq!(backoff.on_rate_limited(None), Duration::from_secs(4));
        assert_eq!(backoff.on_rate_limited(None), Duration::from_secs(16));
        assert_eq!(backoff.on_rate_limited(None), Duration::from_secs(32));
        assert_eq!(backoff.on_transient(), Duration::from_secs(32));
    }

    #[test]
    fn test_first_failure_rate_limited_uses_initial_wait() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(32));
        let mut backoff = Backoff::new(&policy);
        assert_eq!(backoff.on_rate_limited(None), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_after_hint_only_lengthens() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(32));
        let mut backoff = Backoff::new(&policy);
        assert_eq!(
            backoff.on_rate_limited(Some(Duration::from_millis(100))),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff.on_rate_limited(Some(Duration::from_secs(20))),
            Duration::from_secs(20)
        );
        assert_eq!(
            backoff.on_rate_limited(Some(Duration::from_secs(600))),
            Duration::from_secs(32)
        );
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), ""),
            Failure::RateLimited(Some(Duration::from_secs(3)))
        );
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, None, "boom"),
            Failure::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            Failure::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "bad"),
            Failure::Fatal(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, ""),
            Failure::Fatal(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            Failure::Fatal(_)
        ));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let calls = Arc::new(Mutex::new(0u32));
        let c = calls.clone();
        let result = execute_with_retry(Service::Speech, &fast_policy(10), "req", |n| {
            let c = c.clone();
            async move {
                *c.lock().unwrap() += 1;
                if n < 3 {
                    AttemptOutcome::Transient("timeout".to_string())
                } else {
                    AttemptOutcome::Success(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried_and_echoes_request() {
        let calls = Arc::new(Mutex::new(0u32));
        let c = calls.clone();
        let result: Result<(), _> =
            execute_with_retry(Service::Speech, &fast_policy(10), "{\"text\":\"hi\"}", |_| {
                let c = c.clone();
                async move {
                    *c.lock().unwrap() += 1;
                    AttemptOutcome::Fatal("missing audio field".to_string())
                }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(err.kind(), ErrorKind::FatalResponse);
        match err {
            ClientError::Fatal { request, attempts, .. } => {
                assert_eq!(attempts, 1);
                assert!(request.contains("\"text\""));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let result: Result<(), _> =
            execute_with_retry(Service::Image, &fast_policy(4), "req", |n| async move {
                if n % 2 == 0 {
                    AttemptOutcome::RateLimited(None)
                } else {
                    AttemptOutcome::Transient(format!("reset #{}", n))
                }
            })
            .await;
        match result.unwrap_err() {
            ClientError::Exhausted {
                attempts,
                last_kind,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(last_kind, ErrorKind::RateLimited);
                assert_eq!(last_error, "HTTP 429");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probe_of_closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ResilientClient::new(
            Service::Speech,
            fast_policy(10).with_preflight(format!("http://127.0.0.1:{}/", port)),
        )
        .unwrap();
        let calls = Arc::new(Mutex::new(0u32));
        let c = calls.clone();
        let result: Result<Value, _> = client
            .execute_json(
                "req",
                |http: &reqwest::Client| http.get(format!("http://127.0.0.1:{}/gen", port)),
                move |v: Value| {
                    *c.lock().unwrap() += 1;
                    Ok(v)
                },
            )
            .await;
        assert!(matches!(result, Err(ClientError::Unreachable { .. })));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connection_refused_is_retried_then_exhausted() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ResilientClient::new(Service::Text, fast_policy(3)).unwrap();
        let result: Result<Value, _> = client
            .execute_json(
                "req",
                |http: &reqwest::Client| http.get(format!("http://127.0.0.1:{}/", port)),
                |v: Value| Ok(v),
            )
            .await;
        match result.unwrap_err() {
            ClientError::Exhausted {
                attempts, last_kind, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_kind, ErrorKind::TransientNetwork);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_body_is_retried() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(Mutex::new(0u32));
        let h = hits.clone();
        tokio::spawn(async move {
            let replies = [
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"audio\":",
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 14\r\nConnection: close\r\n\r\n{\"audio\":\"QQ\"}",
            ];
            for reply in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                *h.lock().unwrap() += 1;
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        let client = ResilientClient::new(Service::Speech, fast_policy(3)).unwrap();
        let result = client
            .execute_json(
                "req",
                |http: &reqwest::Client| http.post(format!("http://127.0.0.1:{}/gen", port)),
                |v: Value| {
                    v["audio"]
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| "missing audio".to_string())
                },
            )
            .await;
        assert_eq!(result.unwrap(), "QQ");
        assert_eq!(*hits.lock().unwrap(), 2);
    }
}
