//! JSON-RPC client for the node's HTTP RPC interface.
//!
//! One `reqwest::Client` is shared by every RPC source; it is safe to call
//! concurrently and keeps connections alive between ticks. Calls are never
//! retried here, a failed call becomes a failed sample and the next tick
//! is the retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::trace;

use crate::collector::{CollectError, CollectErrorKind};

/// Node is still loading (block index, wallet, ...).
const RPC_IN_WARMUP: i64 = -28;
const RPC_METHOD_NOT_FOUND: i64 = -32601;

/// Longest body excerpt kept in an error message.
const MAX_ERROR_BODY: usize = 256;

/// Failure of a single RPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Credentials rejected (HTTP 401/403).
    Auth,
    /// The node does not know the method.
    MethodNotFound(String),
    /// No connection to the endpoint.
    Connect(String),
    /// No reply within the per-call timeout.
    Timeout(Duration),
    /// The node answered with a JSON-RPC error object.
    Rpc { code: i64, message: String },
    /// Non-success HTTP status without a JSON-RPC error body.
    Http { status: u16, body: String },
    /// Reply is not a JSON-RPC response.
    Malformed(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Auth => write!(f, "authentication rejected"),
            RpcError::MethodNotFound(m) => write!(f, "method not found: {}", m),
            RpcError::Connect(msg) => write!(f, "connection failed: {}", msg),
            RpcError::Timeout(d) => {
                write!(f, "no reply within {}", crate::fmt::format_interval(*d))
            }
            RpcError::Rpc { code, message } => write!(f, "rpc error {}: {}", code, message),
            RpcError::Http { status, body } => write!(f, "HTTP {}: {}", status, body),
            RpcError::Malformed(msg) => write!(f, "malformed reply: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for CollectError {
    fn from(e: RpcError) -> Self {
        let kind = match &e {
            RpcError::Auth => CollectErrorKind::Auth,
            RpcError::MethodNotFound(_) => CollectErrorKind::Unsupported,
            RpcError::Connect(_) => CollectErrorKind::Unavailable,
            RpcError::Timeout(_) => CollectErrorKind::Timeout,
            RpcError::Rpc { code, .. } if *code == RPC_IN_WARMUP => CollectErrorKind::Unavailable,
            RpcError::Rpc { .. } | RpcError::Http { .. } | RpcError::Malformed(_) => {
                CollectErrorKind::Protocol
            }
        };
        CollectError::new(kind, e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Authenticated client for one RPC endpoint.
pub struct RpcClient {
    client: Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Builds a client for `url` (e.g. `http://127.0.0.1:8332/`).
    ///
    /// # Errors
    /// Returns a message if the HTTP client cannot be built.
    pub fn new(
        url: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self, String> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            url: url.into(),
            user,
            password,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `method` with `params` and returns the `result` member.
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        self.call_with_timeout(method, params, self.timeout).await
    }

    /// Like [`call`](Self::call) with a timeout other than the client default.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: &[Value],
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.url).timeout(timeout).json(&body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request.send().await.map_err(|e| transport_error(e, timeout))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RpcError::Auth);
        }
        let text = response.text().await.map_err(|e| transport_error(e, timeout))?;
        trace!(method, id, status = status.as_u16(), bytes = text.len(), "rpc reply");

        match serde_json::from_str::<RpcResponse>(&text) {
            Ok(RpcResponse {
                error: Some(err), ..
            }) => {
                if err.code == RPC_METHOD_NOT_FOUND {
                    Err(RpcError::MethodNotFound(method.to_string()))
                } else {
                    Err(RpcError::Rpc {
                        code: err.code,
                        message: err.message,
                    })
                }
            }
            Ok(RpcResponse { result, .. }) if status.is_success() => {
                Ok(result.unwrap_or(Value::Null))
            }
            Err(e) if status.is_success() => {
                Err(RpcError::Malformed(format!("{}: {}", e, excerpt(&text))))
            }
            _ if status == StatusCode::NOT_FOUND => {
                Err(RpcError::MethodNotFound(method.to_string()))
            }
            _ => Err(RpcError::Http {
                status: status.as_u16(),
                body: excerpt(&text),
            }),
        }
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout(timeout)
    } else if e.is_connect() || e.is_request() {
        RpcError::Connect(e.to_string())
    } else {
        RpcError::Malformed(e.to_string())
    }
}

fn excerpt(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
