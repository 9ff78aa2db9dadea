//! 出站传输层
//!
//! - `Transport`：发送一次请求，网络层失败映射为 TransientNetwork / Timeout，HTTP 状态码原样返回
//! - `HttpTransport`：基于 reqwest 的实现
//! - `RetryableTransport`：在 Transport 之上做有界指数退避重试（见 retry.rs）
//! - `MockTransport`：脚本化应答，供测试与本地演示

mod mock;
mod retry;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::OrchestratorError;

pub use mock::{MockReply, MockTransport};
pub use retry::{Delivered, RetryPolicy, RetryableTransport};

/// 默认单次请求超时
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Bytes(Vec<u8>),
}

/// 发往 Worker 的请求；重试时原样重发，不做任何修改
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
}

impl WorkerRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Json(body),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn post_bytes(url: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Bytes(bytes),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Worker 响应（状态码 + 原始 body）
#[derive(Debug, Clone)]
pub struct WorkerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl WorkerResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json_body(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, OrchestratorError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| OrchestratorError::Protocol(format!("invalid JSON from worker: {e}")))
    }
}

/// 传输 trait：一次请求 → 一次响应
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &WorkerRequest) -> Result<WorkerResponse, OrchestratorError>;
}

/// 基于 reqwest 的 HTTP 传输
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .user_agent(concat!("hive/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| OrchestratorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &WorkerRequest) -> Result<WorkerResponse, OrchestratorError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        }
        .timeout(request.timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(v) => builder.json(v),
            RequestBody::Bytes(b) => builder.body(b.clone()),
        };

        let resp = builder.send().await.map_err(map_reqwest_error)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(map_reqwest_error)?;
        Ok(WorkerResponse::new(status, body.to_vec()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> OrchestratorError {
    if e.is_timeout() {
        OrchestratorError::Timeout
    } else {
        OrchestratorError::TransientNetwork(e.to_string())
    }
}
