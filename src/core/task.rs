//! 任务数据模型
//!
//! Task 是一次编排工作的持久化记录：身份、状态、负载、结果与尝试次数。
//! 状态单调推进：Pending → Processing → {Completed, Failed}，终态之后不再变化。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::OrchestratorError;

/// 任务 ID
pub type TaskId = String;

/// 任务类型：决定 Worker 端点、负载校验与是否支持降级回答
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    CommitSummary,
    #[serde(rename = "MeetingQA")]
    MeetingQa,
    ActionItemExtraction,
    AttachmentUpload,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CommitSummary => "CommitSummary",
            TaskKind::MeetingQa => "MeetingQA",
            TaskKind::ActionItemExtraction => "ActionItemExtraction",
            TaskKind::AttachmentUpload => "AttachmentUpload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CommitSummary" => Some(TaskKind::CommitSummary),
            "MeetingQA" => Some(TaskKind::MeetingQa),
            "ActionItemExtraction" => Some(TaskKind::ActionItemExtraction),
            "AttachmentUpload" => Some(TaskKind::AttachmentUpload),
            _ => None,
        }
    }

    /// Worker 不可达时能否给出降级回答（目前只有会议问答）
    pub fn supports_fallback(&self) -> bool {
        matches!(self, TaskKind::MeetingQa)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// 已创建，尚未发往 Worker
    Pending,
    /// Worker 已接收或正在执行
    Processing,
    /// 已完成（Worker 返回真实结果）
    Completed,
    /// 执行失败（可能附带降级结果）
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 生命周期中的位置；只允许向更大的 rank 推进
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    /// 从 `self` 迁移到 `next` 是否合法：终态不可离开，且不能回退
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Processing => "Processing",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(TaskStatus::Pending),
            "Processing" => Some(TaskStatus::Processing),
            "Completed" => Some(TaskStatus::Completed),
            "Failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 编排任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub idempotency_key: String,
    pub status: TaskStatus,
    /// 交给 Worker 的原始输入（编排层视为不透明）
    pub payload: Value,
    /// 仅在 Completed 或 Failed（带降级结果）时存在；一旦写入终态即不可变
    pub result: Option<Value>,
    /// 失败原因
    pub error: Option<String>,
    /// 已进行的传输尝试次数
    pub attempt: u32,
    /// 完成后接收通知的用户
    pub owner_id: String,
    /// 提交时的实体 ID（仓库 / 会议）
    pub owner_entity_id: String,
    /// 毫秒时间戳
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn new(
        kind: TaskKind,
        owner_id: impl Into<String>,
        owner_entity_id: impl Into<String>,
        idempotency_key: String,
        payload: Value,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            kind,
            idempotency_key,
            status: TaskStatus::Pending,
            payload,
            result: None,
            error: None,
            attempt: 0,
            owner_id: owner_id.into(),
            owner_entity_id: owner_entity_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 按任务类型校验负载，并给出内容指纹
///
/// - CommitSummary：`commitData.sha`
/// - MeetingQA / ActionItemExtraction：`meetingId` + 归一化后的 `question`
/// - AttachmentUpload：`fileName` + base64 `content` 的 SHA-256
pub fn content_fingerprint(kind: TaskKind, payload: &Value) -> Result<String, OrchestratorError> {
    if !payload.is_object() {
        return Err(OrchestratorError::Validation(
            "payload must be a JSON object".to_string(),
        ));
    }
    match kind {
        TaskKind::CommitSummary => {
            let sha = payload
                .pointer("/commitData/sha")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    OrchestratorError::Validation("commitData.sha is required".to_string())
                })?;
            Ok(sha.to_lowercase())
        }
        TaskKind::MeetingQa | TaskKind::ActionItemExtraction => {
            let meeting_id = required_str(payload, "meetingId")?;
            let question = required_str(payload, "question")?;
            let normalized = question
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            Ok(format!("{meeting_id}:{normalized}"))
        }
        TaskKind::AttachmentUpload => {
            let file_name = required_str(payload, "fileName")?;
            let content = decode_attachment(payload)?;
            Ok(format!("{file_name}:{}", sha256_hex(&content)))
        }
    }
}

/// 幂等键：对 `kind:ownerEntityId:fingerprint` 做 SHA-256
pub fn idempotency_key(kind: TaskKind, owner_entity_id: &str, fingerprint: &str) -> String {
    sha256_hex(format!("{}:{}:{}", kind.as_str(), owner_entity_id, fingerprint).as_bytes())
}

/// 解出附件负载中的二进制内容
pub fn decode_attachment(payload: &Value) -> Result<Vec<u8>, OrchestratorError> {
    use base64::Engine as _;

    let encoded = required_str(payload, "content")?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| OrchestratorError::Validation(format!("content is not valid base64: {e}")))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, OrchestratorError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| OrchestratorError::Validation(format!("{field} is required")))
}
