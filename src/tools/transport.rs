//! 工具传输层
//!
//! - `HttpTransport`：`POST {endpoint}/invoke` 发送请求信封，`GET {endpoint}/health` 做存活探测
//! - `SchemeTransport`：按 endpoint 协议分发，`local://` 走进程内工具，其余走 HTTP

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::core::ErrorKind;
use crate::tools::{InvokeRequest, InvokeResponse, LocalTransport, ProbeAck, ToolDescriptor};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("correlation id mismatch: expected {expected}, got {actual}")]
    CorrelationMismatch { expected: Uuid, actual: Uuid },
}

impl TransportError {
    /// 超时、连接失败、5xx / 429 可重试
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Connection(_) => true,
            TransportError::Http { status, .. } => *status >= 500 || *status == 429,
            TransportError::Malformed(_) | TransportError::CorrelationMismatch { .. } => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::TransientCollaborator
        } else {
            ErrorKind::DataIntegrity
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// 工具传输：发送一次调用、做一次探测
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        request: &InvokeRequest,
        timeout: Duration,
    ) -> Result<InvokeResponse, TransportError>;

    async fn probe(&self, descriptor: &ToolDescriptor, timeout: Duration) -> Result<(), TransportError>;
}

/// HTTP 传输（reqwest）
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(descriptor: &ToolDescriptor, path: &str) -> String {
        format!("{}/{}", descriptor.endpoint.trim_end_matches('/'), path)
    }

    fn map_reqwest(err: reqwest::Error, timeout: Duration) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if err.is_decode() {
            TransportError::Malformed(err.to_string())
        } else {
            TransportError::Connection(err.to_string())
        }
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        request: &InvokeRequest,
        timeout: Duration,
    ) -> Result<InvokeResponse, TransportError> {
        let response = self
            .client
            .post(Self::url(descriptor, "invoke"))
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| Self::map_reqwest(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::map_reqwest(e, timeout))?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    async fn probe(&self, descriptor: &ToolDescriptor, timeout: Duration) -> Result<(), TransportError> {
        let response = self
            .client
            .get(Self::url(descriptor, "health"))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Self::map_reqwest(e, timeout))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        let body = response.text().await.map_err(|e| Self::map_reqwest(e, timeout))?;
        let ack = ProbeAck::parse(&body);
        if ack.is_healthy() {
            Ok(())
        } else {
            Err(TransportError::Http {
                status: status.as_u16(),
                body: format!("tool reports status `{}`", ack.status.unwrap_or_default()),
            })
        }
    }
}

/// 按 endpoint 协议分发：`local://` → LocalTransport，其余 → HttpTransport
pub struct SchemeTransport {
    http: HttpTransport,
    local: Arc<LocalTransport>,
}

impl SchemeTransport {
    pub fn new(http: HttpTransport, local: Arc<LocalTransport>) -> Self {
        Self { http, local }
    }

    fn is_local(descriptor: &ToolDescriptor) -> bool {
        descriptor.endpoint.starts_with(crate::tools::local::LOCAL_SCHEME)
    }
}

#[async_trait]
impl ToolTransport for SchemeTransport {
    async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        request: &InvokeRequest,
        timeout: Duration,
    ) -> Result<InvokeResponse, TransportError> {
        if Self::is_local(descriptor) {
            self.local.invoke(descriptor, request, timeout).await
        } else {
            self.http.invoke(descriptor, request, timeout).await
        }
    }

    async fn probe(&self, descriptor: &ToolDescriptor, timeout: Duration) -> Result<(), TransportError> {
        if Self::is_local(descriptor) {
            self.local.probe(descriptor, timeout).await
        } else {
            self.http.probe(descriptor, timeout).await
        }
    }
}
