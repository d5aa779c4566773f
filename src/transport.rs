// ===============================
// src/transport.rs
// ===============================
//
// Signed HTTP to the Delta REST API.
//
// Signature contract (must match the server's reconstruction byte-for-byte):
//   HMAC-SHA256(secret, method + timestamp + path + query_string + body)
// where query_string carries a leading '?' iff a query is present. The same
// query/body bytes used for signing are the ones sent on the wire.
//
// Retry policy: 502/503/504/522/524 retry with exponential backoff
// (0.6s base, x1.8, 4 attempts, jitter); 429 honors Retry-After when given.
// Anything else, and any payload with success=false, is terminal. After the
// transient budget is spent, authenticated requests get one shot against the
// fallback host if one is configured.
//
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::Method;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

const TRANSIENT_STATUS: [u16; 5] = [502, 503, 504, 522, 524];
const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE_MS: u64 = 600;
const BACKOFF_MULT: f64 = 1.8;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("delta-grid-bot/", env!("CARGO_PKG_VERSION"));

pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Hex HMAC-SHA256 over the exact signed message. `query_string` is the raw
/// joined query without the '?'; it is prefixed here iff non-empty.
pub fn sign_request(
    secret: &str,
    method: &str,
    timestamp: &str,
    path: &str,
    query_string: &str,
    body: &str,
) -> String {
    let mut message =
        String::with_capacity(method.len() + timestamp.len() + path.len() + query_string.len() + body.len() + 1);
    message.push_str(method);
    message.push_str(timestamp);
    message.push_str(path);
    if !query_string.is_empty() {
        message.push('?');
        message.push_str(query_string);
    }
    message.push_str(body);

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Credential/signature rejection. Terminal; callers must not retry.
    #[error("auth rejected: {0}")]
    Auth(String),
    /// Non-transient HTTP status with an unparseable body.
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    /// Exchange-level failure flag (success=false) with an error code.
    #[error("exchange error {code}: {detail}")]
    Api { code: String, detail: String },
    #[error("network: {0}")]
    Network(#[from] reqwest::Error),
    #[error("transient failures exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("unexpected payload: {0}")]
    Payload(String),
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth(_))
    }
    pub fn api_code(&self) -> Option<&str> {
        match self {
            TransportError::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

fn is_transient(status: u16) -> bool {
    TRANSIENT_STATUS.contains(&status)
}

fn backoff_delay(attempt: u32) -> Duration {
    let ms = (BACKOFF_BASE_MS as f64) * BACKOFF_MULT.powi(attempt as i32);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(ms as u64 + jitter)
}

fn auth_error_code(code: &str) -> bool {
    matches!(
        code,
        "invalid_api_key"
            | "unauthorized"
            | "signature_expired"
            | "invalid_signature"
            | "ip_not_whitelisted_for_api_key"
    )
}

pub struct Transport {
    http: reqwest::Client,
    base_url: String,
    fallback_url: Option<String>,
    api_key: String,
    api_secret: String,
}

impl Transport {
    pub fn new(
        base_url: String,
        fallback_url: Option<String>,
        api_key: String,
        api_secret: String,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            fallback_url: fallback_url.map(|u| u.trim_end_matches('/').to_string()),
            api_key,
            api_secret,
        })
    }

    /// Issue one request with retries. `query` pairs are joined in insertion
    /// order; `body` is serialized compactly once and those exact bytes are
    /// both signed and sent.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
        auth: bool,
    ) -> Result<serde_json::Value, TransportError> {
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let body_string = match body {
            Some(v) => serde_json::to_string(v)
                .map_err(|e| TransportError::Payload(e.to_string()))?,
            None => String::new(),
        };

        let mut last_transient = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            match self
                .send_once(&self.base_url, &method, path, &query_string, &body_string, auth)
                .await
            {
                Ok(value) => return Ok(value),
                Err(Retry::Terminal(e)) => return Err(e),
                Err(Retry::After(explicit, why)) => {
                    // Retry-After wins when the server gave one; otherwise
                    // the exponential schedule keyed by attempt number.
                    let delay = explicit.unwrap_or_else(|| backoff_delay(attempt));
                    warn!(%path, attempt, delay_ms = delay.as_millis() as u64, %why, "transient, backing off");
                    last_transient = why;
                    if attempt + 1 < MAX_ATTEMPTS {
                        sleep(delay).await;
                    }
                }
            }
        }

        // One fallback-host shot, authenticated requests only.
        if auth {
            if let Some(fallback) = &self.fallback_url {
                warn!(%path, %fallback, "primary exhausted, trying fallback host");
                match self
                    .send_once(fallback, &method, path, &query_string, &body_string, auth)
                    .await
                {
                    Ok(value) => return Ok(value),
                    Err(Retry::Terminal(e)) => return Err(e),
                    Err(Retry::After(_, why)) => last_transient = why,
                }
            }
        }

        Err(TransportError::Exhausted { attempts: MAX_ATTEMPTS, last: last_transient })
    }

    async fn send_once(
        &self,
        host: &str,
        method: &Method,
        path: &str,
        query_string: &str,
        body_string: &str,
        auth: bool,
    ) -> Result<serde_json::Value, Retry> {
        let url = if query_string.is_empty() {
            format!("{host}{path}")
        } else {
            format!("{host}{path}?{query_string}")
        };

        let mut req = self
            .http
            .request(method.clone(), &url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT);

        if auth {
            // Fresh timestamp per attempt, never reuse a signature
            let ts = timestamp_secs().to_string();
            let sig = sign_request(
                &self.api_secret,
                method.as_str(),
                &ts,
                path,
                query_string,
                body_string,
            );
            req = req
                .header("api-key", &self.api_key)
                .header("timestamp", ts)
                .header("signature", sig);
        }
        if !body_string.is_empty() {
            req = req.body(body_string.to_string());
        }

        let resp = match req.send().await {
            Ok(r) => r,
            // Connect/read failures count against the transient budget
            Err(e) => return Err(Retry::After(None, e.to_string())),
        };

        let status = resp.status().as_u16();
        debug!(%url, status, "response");

        if status == 429 {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Retry::After(retry_after, "rate limited (429)".to_string()));
        }
        if is_transient(status) {
            return Err(Retry::After(None, format!("http {status}")));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| Retry::Terminal(TransportError::Network(e)))?;

        if status == 401 || status == 403 {
            return Err(Retry::Terminal(TransportError::Auth(text)));
        }

        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) if status >= 400 => {
                return Err(Retry::Terminal(TransportError::Status { status, body: text }))
            }
            Err(e) => return Err(Retry::Terminal(TransportError::Payload(e.to_string()))),
        };

        // Delta wraps everything in { success, result | error }
        if value.get("success").and_then(|s| s.as_bool()) == Some(false) {
            let code = value
                .pointer("/error/code")
                .and_then(|c| c.as_str())
                .unwrap_or("unknown")
                .to_string();
            let detail = value
                .get("error")
                .map(|e| e.to_string())
                .unwrap_or_else(|| text.clone());
            if auth_error_code(&code) {
                return Err(Retry::Terminal(TransportError::Auth(detail)));
            }
            return Err(Retry::Terminal(TransportError::Api { code, detail }));
        }
        if status >= 400 {
            return Err(Retry::Terminal(TransportError::Status { status, body: text }));
        }

        Ok(value)
    }
}

enum Retry {
    /// Back off and try again; an explicit duration comes from Retry-After.
    After(Option<Duration>, String),
    Terminal(TransportError),
}
