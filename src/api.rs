//! HTTP 接口（`server` feature）
//!
//! - `POST /api/tasks`：提交任务 `{kind, ownerId, ownerEntityId, payload}`
//! - `GET  /api/tasks/:id`：查询任务
//! - `POST /api/tasks/:id/reconcile`：向 Worker 对账一次
//! - `GET  /api/notifications/:owner`：内存通知箱
//! - `GET  /api/attachments/download?token=`：校验下载令牌
//! - `GET  /api/health`

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::{OrchestratorError, TaskKind};
use crate::orchestrator::Hive;
use crate::token::TokenError;

type ApiResult<T> = Result<T, (StatusCode, String)>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub kind: String,
    pub owner_id: String,
    pub owner_entity_id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub token: String,
}

fn error_status(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::WorkerUnavailable { .. } | OrchestratorError::ServiceBusy => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        OrchestratorError::WorkerRejected { .. } | OrchestratorError::Protocol(_) => {
            StatusCode::BAD_GATEWAY
        }
        OrchestratorError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(e: OrchestratorError) -> (StatusCode, String) {
    (error_status(&e), e.to_string())
}

pub fn router(hive: Hive) -> Router {
    Router::new()
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/reconcile", post(reconcile_task))
        .route("/api/notifications/:owner", get(list_notifications))
        .route("/api/attachments/download", get(download))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(hive)
}

async fn submit_task(
    State(hive): State<Hive>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let kind = TaskKind::parse(&req.kind)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown task kind '{}'", req.kind)))?;
    let outcome = hive
        .submit(kind, &req.owner_id, &req.owner_entity_id, req.payload)
        .await
        .map_err(reject)?;
    let code = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((code, Json(json!(outcome))))
}

async fn get_task(State(hive): State<Hive>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let task = hive.get(&id).await.map_err(reject)?;
    Ok(Json(json!(task)))
}

async fn reconcile_task(State(hive): State<Hive>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let status = hive.reconcile(&id).await.map_err(reject)?;
    Ok(Json(json!({ "taskId": id, "status": status })))
}

async fn list_notifications(
    State(hive): State<Hive>,
    Path(owner): Path<String>,
) -> Json<Value> {
    let items = hive.inbox().list(&owner).await;
    let unread = hive.inbox().unread_count(&owner).await;
    Json(json!({ "notifications": items, "unread": unread }))
}

async fn download(
    State(hive): State<Hive>,
    Query(q): Query<DownloadQuery>,
) -> ApiResult<Json<Value>> {
    let claim = hive.verify_download_token(&q.token).map_err(|e| match e {
        TokenError::Expired => (StatusCode::GONE, e.to_string()),
        _ => (StatusCode::FORBIDDEN, e.to_string()),
    })?;
    let task = hive.get(&claim.attachment_id).await.map_err(reject)?;
    if task.owner_id != claim.user_id {
        return Err((StatusCode::FORBIDDEN, "token does not match attachment owner".to_string()));
    }
    Ok(Json(json!({
        "attachmentId": task.id,
        "status": task.status,
        "result": task.result,
    })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::AppConfig;
    use crate::transport::{MockReply, MockTransport};

    async fn app(mock: Arc<MockTransport>) -> (Router, Hive) {
        let hive = Hive::builder(AppConfig::default())
            .with_transport(mock)
            .build()
            .await
            .unwrap();
        (router(hive.clone()), hive)
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_then_dedup() {
        let mock = Arc::new(MockTransport::new());
        mock.route("/process-commit-summary", vec![MockReply::json(202, json!({"status": "queued"}))]);
        mock.route("/job/*", vec![MockReply::json(200, json!({"status": "running"}))]);
        let (app, _) = app(mock).await;
        let body = json!({
            "kind": "CommitSummary",
            "ownerId": "u1",
            "ownerEntityId": "repo_1",
            "payload": {"commitData": {"sha": "ABC123"}}
        });

        let first = app.clone().oneshot(post_json("/api/tasks", body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let first = body_json(first).await;

        let second = app.clone().oneshot(post_json("/api/tasks", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let second = body_json(second).await;
        assert_eq!(first["taskId"], second["taskId"]);
        assert_eq!(second["deduplicated"], true);

        let uri = format!("/api/tasks/{}", first["taskId"].as_str().unwrap());
        let got = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(got.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_validation_and_unknown_kind() {
        let (app, _) = app(Arc::new(MockTransport::new())).await;
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/tasks",
                json!({"kind": "Poetry", "ownerId": "u", "ownerEntityId": "e", "payload": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/tasks",
                json!({"kind": "MeetingQA", "ownerId": "u", "ownerEntityId": "e", "payload": {"meetingId": "m"}}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(Request::builder().uri("/api/tasks/task_nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_token_checks() {
        let (app, hive) = app(Arc::new(MockTransport::new())).await;
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/attachments/download?token=garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let token = hive.issue_download_token("task_missing", "u1");
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/attachments/download?token={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
