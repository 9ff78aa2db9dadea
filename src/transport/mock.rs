//! Mock 传输（用于测试与本地演示，无需真实 Worker）
//!
//! 按 URL 路径配置应答脚本：脚本按顺序消费，最后一条会一直重复。
//! 以 `*` 结尾的路由按前缀匹配（如 `/job/*`）；未配置的路径返回 404。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{Transport, WorkerRequest, WorkerResponse};
use crate::core::OrchestratorError;

/// 单次应答
#[derive(Debug, Clone)]
pub enum MockReply {
    Response { status: u16, body: Vec<u8> },
    /// 模拟连接失败
    NetworkError,
    /// 永不返回（用于超时测试）
    Hang,
}

impl MockReply {
    pub fn status(status: u16) -> Self {
        MockReply::Response {
            status,
            body: Vec::new(),
        }
    }

    pub fn json(status: u16, body: Value) -> Self {
        MockReply::Response {
            status,
            body: body.to_string().into_bytes(),
        }
    }
}

/// 脚本化的 Transport
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<MockReply>>>,
    requests: Mutex<Vec<WorkerRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置（覆盖）某路径的应答脚本
    pub fn route(&self, path: &str, replies: Vec<MockReply>) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(path.to_string(), replies.into());
        }
    }

    /// 收到的全部请求（按顺序）
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// 命中某路由的请求数
    pub fn calls_to(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| route_matches(path, url_path(&r.url)))
            .count()
    }

    fn next_reply(&self, path: &str) -> Option<MockReply> {
        let mut routes = self.routes.lock().ok()?;
        let key = routes
            .keys()
            .filter(|k| route_matches(k, path))
            .max_by_key(|k| k.len())
            .cloned()?;
        let script = routes.get_mut(&key)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

fn url_path(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    match rest.find('/') {
        Some(i) => &rest[i..],
        None => "/",
    }
}

fn route_matches(route: &str, path: &str) -> bool {
    match route.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => route == path,
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &WorkerRequest) -> Result<WorkerResponse, OrchestratorError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        match self.next_reply(url_path(&request.url)) {
            Some(MockReply::Response { status, body }) => Ok(WorkerResponse::new(status, body)),
            Some(MockReply::NetworkError) => Err(OrchestratorError::TransientNetwork(
                "connection refused".to_string(),
            )),
            Some(MockReply::Hang) => std::future::pending().await,
            None => Ok(WorkerResponse::new(404, "not found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("http://host:8000/job/abc"), "/job/abc");
        assert_eq!(url_path("https://host"), "/");
        assert_eq!(url_path("/meeting-qa"), "/meeting-qa");
    }

    #[tokio::test]
    async fn test_script_is_consumed_then_sticky() {
        let mock = MockTransport::new();
        mock.route("/x", vec![MockReply::status(503), MockReply::status(200)]);
        let req = WorkerRequest::get("http://h/x");
        assert_eq!(mock.send(&req).await.unwrap().status, 503);
        assert_eq!(mock.send(&req).await.unwrap().status, 200);
        assert_eq!(mock.send(&req).await.unwrap().status, 200);
        assert_eq!(mock.calls_to("/x"), 3);
    }

    #[tokio::test]
    async fn test_unrouted_path_is_404_and_prefix_routes() {
        let mock = MockTransport::new();
        mock.route("/job/*", vec![MockReply::status(200)]);
        assert_eq!(mock.send(&WorkerRequest::get("http://h/job/1")).await.unwrap().status, 200);
        assert_eq!(mock.send(&WorkerRequest::get("http://h/other")).await.unwrap().status, 404);
        assert_eq!(mock.calls_to("/job/*"), 1);
    }
}
