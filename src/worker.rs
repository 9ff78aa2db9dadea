//! Worker 客户端：按任务类型选择端点、组装请求、解析应答
//!
//! 端点：
//! - `GET  /job/{taskId}` → `{status, result?, error?}`
//! - `POST /process-commit-summary` → 异步作业句柄
//! - `POST /meeting-qa` → `{result: {status, answer, confidence, suggestedTimestamp, relatedSegments}}`
//! - `POST /extract-action-items` → 行动项列表
//! - `POST /upload-url` → `{uploadUrl, authorizationToken, fileName}`，随后直传二进制到 uploadUrl

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerSection;
use crate::core::{decode_attachment, sha256_hex, OrchestratorError, Task, TaskKind, TaskStatus};
use crate::transport::{RetryableTransport, WorkerRequest};

/// 会议问答结果（Worker 返回或降级生成）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingAnswer {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub suggested_timestamp: Option<f64>,
    #[serde(default)]
    pub related_segments: Vec<Value>,
    /// 是否为本地降级生成
    #[serde(default)]
    pub fallback: bool,
}

/// 行动项（`title` 视为 `description` 的别名）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    #[serde(alias = "title")]
    pub description: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub deadline: Option<String>,
}

/// 直传三元组
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTarget {
    pub upload_url: String,
    pub authorization_token: String,
    pub file_name: String,
}

/// Worker 上报的作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
}

impl JobState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" | "pending" => Some(JobState::Queued),
            "running" | "processing" => Some(JobState::Running),
            "done" | "completed" | "success" => Some(JobState::Done),
            "error" | "failed" => Some(JobState::Error),
            _ => None,
        }
    }

    /// 映射到内部状态：queued/running → Processing，done → Completed，error → Failed
    pub fn task_status(&self) -> TaskStatus {
        match self {
            JobState::Queued | JobState::Running => TaskStatus::Processing,
            JobState::Done => TaskStatus::Completed,
            JobState::Error => TaskStatus::Failed,
        }
    }
}

/// `GET /job/{taskId}` 的解析结果
#[derive(Debug, Clone)]
pub struct JobReport {
    pub state: JobState,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// 提交后的 Worker 应答
#[derive(Debug, Clone)]
pub enum SubmitReply {
    /// 同步给出了结果
    Finished(Value),
    /// 已受理，需轮询 `/job/{taskId}`
    Accepted,
    /// 同步应答中 Worker 自报失败（status = error / failed）
    Failed(String),
}

#[derive(Deserialize)]
struct RawJob {
    status: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Worker 客户端
#[derive(Clone)]
pub struct WorkerClient {
    transport: RetryableTransport,
    config: WorkerSection,
}

impl WorkerClient {
    pub fn new(transport: RetryableTransport, config: WorkerSection) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &RetryableTransport {
        &self.transport
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// 把任务发给对应端点；返回应答与所用尝试次数
    pub async fn submit(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<(SubmitReply, u32), OrchestratorError> {
        let timeout = self.config.timeout_for(task.kind);
        match task.kind {
            TaskKind::CommitSummary => {
                let body = json!({
                    "taskId": task.id,
                    "ownerEntityId": task.owner_entity_id,
                    "commitData": task.payload.get("commitData").cloned().unwrap_or(Value::Null),
                    "changes": task.payload.get("changes").cloned().unwrap_or_else(|| json!([])),
                });
                let req = WorkerRequest::post_json(self.url("/process-commit-summary"), body)
                    .with_timeout(timeout);
                let delivered = self.transport.call_with_cancel(&req, cancel).await?;
                let reply = match delivered.response.json::<RawJob>() {
                    Ok(job) => match JobState::parse(&job.status) {
                        Some(JobState::Done) => SubmitReply::Finished(job.result.unwrap_or(Value::Null)),
                        Some(JobState::Error) => SubmitReply::Failed(
                            job.error
                                .unwrap_or_else(|| "worker reported an error".to_string()),
                        ),
                        _ => SubmitReply::Accepted,
                    },
                    Err(_) => SubmitReply::Accepted,
                };
                Ok((reply, delivered.attempts))
            }
            TaskKind::MeetingQa => {
                let req = WorkerRequest::post_json(self.url("/meeting-qa"), question_body(task))
                    .with_timeout(timeout);
                let delivered = self.transport.call_with_cancel(&req, cancel).await?;
                let body: Value = delivered.response.json()?;
                let raw = body.get("result").cloned().unwrap_or(body);
                let answer: MeetingAnswer = serde_json::from_value(raw).map_err(|e| {
                    OrchestratorError::Protocol(format!("malformed meeting-qa result: {e}"))
                })?;
                let reply = match JobState::parse(&answer.status) {
                    Some(JobState::Queued | JobState::Running) => SubmitReply::Accepted,
                    Some(JobState::Error) if answer.answer.is_empty() => {
                        SubmitReply::Failed("worker reported an error".to_string())
                    }
                    Some(JobState::Error) => {
                        SubmitReply::Failed(format!("worker reported an error: {}", answer.answer))
                    }
                    _ => SubmitReply::Finished(serde_json::to_value(&answer).map_err(|e| {
                        OrchestratorError::Protocol(e.to_string())
                    })?),
                };
                Ok((reply, delivered.attempts))
            }
            TaskKind::ActionItemExtraction => {
                let req = WorkerRequest::post_json(self.url("/extract-action-items"), question_body(task))
                    .with_timeout(timeout);
                let delivered = self.transport.call_with_cancel(&req, cancel).await?;
                let items = parse_action_items(&delivered.response.json()?)?;
                Ok((
                    SubmitReply::Finished(json!({ "actionItems": items })),
                    delivered.attempts,
                ))
            }
            TaskKind::AttachmentUpload => self.upload(task, cancel).await,
        }
    }

    /// 直传附件：先取上传地址，再带文件名与校验和头上传二进制
    ///
    /// 两次调用各自重试，记录的尝试次数取较大者。
    async fn upload(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<(SubmitReply, u32), OrchestratorError> {
        let content = decode_attachment(&task.payload)?;
        let file_name = task
            .payload
            .get("fileName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let content_type = task
            .payload
            .get("contentType")
            .and_then(Value::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();
        let timeout = self.config.timeout_for(TaskKind::AttachmentUpload);

        let target_req = WorkerRequest::post_json(
            self.url("/upload-url"),
            json!({ "taskId": task.id, "fileName": file_name, "ownerEntityId": task.owner_entity_id }),
        )
        .with_timeout(timeout);
        let target_resp = self.transport.call_with_cancel(&target_req, cancel).await?;
        let target: UploadTarget = target_resp.response.json()?;

        let checksum = sha256_hex(&content);
        let size = content.len();
        let upload_req = WorkerRequest::post_bytes(target.upload_url.clone(), content)
            .with_header("Authorization", target.authorization_token.clone())
            .with_header("X-File-Name", encode_file_name(&target.file_name))
            .with_header("Content-Type", content_type)
            .with_header("X-Content-Sha256", checksum.clone())
            .with_timeout(timeout);
        let uploaded = self.transport.call_with_cancel(&upload_req, cancel).await?;

        tracing::info!("Uploaded {} ({} bytes) for {}", target.file_name, size, task.id);
        Ok((
            SubmitReply::Finished(json!({
                "fileName": target.file_name,
                "size": size,
                "contentSha256": checksum,
            })),
            target_resp.attempts.max(uploaded.attempts),
        ))
    }

    /// 查询作业状态；404 → NotFound
    pub async fn job_status(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<JobReport, OrchestratorError> {
        let req = WorkerRequest::get(self.url(&format!("/job/{task_id}")))
            .with_timeout(self.config.job_status_timeout());
        let delivered = match self.transport.call_with_cancel(&req, cancel).await {
            Ok(d) => d,
            Err(OrchestratorError::WorkerRejected { status: 404, .. }) => {
                return Err(OrchestratorError::NotFound(format!("job {task_id}")))
            }
            Err(e) => return Err(e),
        };
        let raw: RawJob = delivered.response.json()?;
        let state = JobState::parse(&raw.status).ok_or_else(|| {
            OrchestratorError::Protocol(format!("unknown job status '{}'", raw.status))
        })?;
        Ok(JobReport {
            state,
            result: raw.result,
            error: raw.error,
        })
    }
}

fn question_body(task: &Task) -> Value {
    json!({
        "meetingId": task.payload.get("meetingId").cloned().unwrap_or(Value::Null),
        "question": task.payload.get("question").cloned().unwrap_or(Value::Null),
        "userId": task.owner_id,
    })
}

/// 接受 `[...]`、`{actionItems: [...]}` 或 `{result: [...]}` 三种形态
pub fn parse_action_items(body: &Value) -> Result<Vec<ActionItem>, OrchestratorError> {
    let list = match body {
        Value::Array(_) => body,
        _ => body
            .get("actionItems")
            .or_else(|| body.get("action_items"))
            .or_else(|| body.get("result"))
            .ok_or_else(|| OrchestratorError::Protocol("no action items in response".to_string()))?,
    };
    serde_json::from_value(list.clone())
        .map_err(|e| OrchestratorError::Protocol(format!("malformed action items: {e}")))
}

/// 文件名按 URL 规则做百分号编码（保留 `/`）
fn encode_file_name(name: &str) -> String {
    name.split('/')
        .map(urlencoding::encode)
        .collect::<Vec<_>>()
        .join("/")
}
