//! 任务完成通知
//!
//! 只有首次把任务推入终态的写者调用 `on_terminal`，因此每个任务最多通知一次。
//! 通知是尽力而为的：投递失败只记录日志，不回滚任务的终态。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};

use crate::config::NotificationSection;
use crate::core::{Task, TaskId, TaskKind, TaskStatus};

/// 发给任务所有者的通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub owner_id: String,
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub title: String,
    pub message: String,
    pub action_link: Option<String>,
    pub read: bool,
    pub created_at: i64,
}

/// 通知投递端
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: Notification) -> anyhow::Result<()>;
}

/// 内存通知箱：按用户保存，可查询未读数与标记已读
#[derive(Default)]
pub struct MemoryNotificationSink {
    inbox: RwLock<HashMap<String, Vec<Notification>>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用户的全部通知（最新在前）
    pub async fn list(&self, owner_id: &str) -> Vec<Notification> {
        let inbox = self.inbox.read().await;
        let mut items = inbox.get(owner_id).cloned().unwrap_or_default();
        items.reverse();
        items
    }

    pub async fn unread_count(&self, owner_id: &str) -> usize {
        self.inbox
            .read()
            .await
            .get(owner_id)
            .map(|items| items.iter().filter(|n| !n.read).count())
            .unwrap_or(0)
    }

    /// 标记已读；返回是否找到该通知
    pub async fn mark_read(&self, owner_id: &str, notification_id: &str) -> bool {
        let mut inbox = self.inbox.write().await;
        if let Some(n) = inbox
            .get_mut(owner_id)
            .and_then(|items| items.iter_mut().find(|n| n.id == notification_id))
        {
            n.read = true;
            return true;
        }
        false
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn deliver(&self, notification: Notification) -> anyhow::Result<()> {
        self.inbox
            .write()
            .await
            .entry(notification.owner_id.clone())
            .or_default()
            .push(notification);
        Ok(())
    }
}

/// 通道通知：转发给外部消费者（推送、邮件等）
pub struct ChannelNotificationSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotificationSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotificationSink {
    async fn deliver(&self, notification: Notification) -> anyhow::Result<()> {
        self.tx
            .send(notification)
            .map_err(|_| anyhow::anyhow!("notification receiver dropped"))
    }
}

/// 按任务类型与终态渲染的模板
struct Template {
    title: &'static str,
    message: &'static str,
    link: Option<&'static str>,
}

fn template_for(kind: TaskKind, status: TaskStatus, has_result: bool) -> Template {
    match (kind, status) {
        (TaskKind::CommitSummary, TaskStatus::Completed) => Template {
            title: "Commit summary ready",
            message: "The AI summary for commit {entity} is ready to read.",
            link: Some("/repositories/{entity}/commits"),
        },
        (TaskKind::CommitSummary, _) => Template {
            title: "Commit summary failed",
            message: "We could not summarize commit {entity}: {error}",
            link: Some("/repositories/{entity}/commits"),
        },
        (TaskKind::MeetingQa, TaskStatus::Completed) => Template {
            title: "Your meeting question was answered",
            message: "An answer to your question about meeting {entity} is available.",
            link: Some("/meetings/{entity}"),
        },
        (TaskKind::MeetingQa, _) if has_result => Template {
            title: "Preliminary answer available",
            message: "The answer service was unavailable, so we prepared a lower-confidence answer for meeting {entity}.",
            link: Some("/meetings/{entity}"),
        },
        (TaskKind::MeetingQa, _) => Template {
            title: "Meeting question failed",
            message: "We could not answer your question about meeting {entity}: {error}",
            link: Some("/meetings/{entity}"),
        },
        (TaskKind::ActionItemExtraction, TaskStatus::Completed) => Template {
            title: "Action items extracted",
            message: "{count} action items were extracted from meeting {entity}.",
            link: Some("/meetings/{entity}/action-items"),
        },
        (TaskKind::ActionItemExtraction, _) => Template {
            title: "Action item extraction failed",
            message: "We could not extract action items from meeting {entity}: {error}",
            link: Some("/meetings/{entity}"),
        },
        (TaskKind::AttachmentUpload, TaskStatus::Completed) => Template {
            title: "Upload complete",
            message: "{file} was uploaded successfully.",
            link: None,
        },
        (TaskKind::AttachmentUpload, _) => Template {
            title: "Upload failed",
            message: "{file} could not be uploaded: {error}",
            link: None,
        },
    }
}

/// 终态通知发射器
#[derive(Clone)]
pub struct NotificationEmitter {
    sink: Arc<dyn NotificationSink>,
    config: NotificationSection,
}

impl NotificationEmitter {
    pub fn new(sink: Arc<dyn NotificationSink>, config: NotificationSection) -> Self {
        Self { sink, config }
    }

    /// 渲染通知；非终态任务返回 None
    pub fn render(&self, task: &Task) -> Option<Notification> {
        if !task.status.is_terminal() {
            return None;
        }
        let t = template_for(task.kind, task.status, task.result.is_some());

        let count = task
            .result
            .as_ref()
            .and_then(|r| r.get("actionItems"))
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0)
            .to_string();
        let file = task
            .payload
            .get("fileName")
            .and_then(|v| v.as_str())
            .unwrap_or("Your file");
        let error = task.error.as_deref().unwrap_or("unknown error");
        let fill = |s: &str| {
            s.replace("{entity}", &task.owner_entity_id)
                .replace("{count}", &count)
                .replace("{file}", file)
                .replace("{error}", error)
        };

        Some(Notification {
            id: format!("notif_{}", uuid::Uuid::new_v4()),
            owner_id: task.owner_id.clone(),
            task_id: task.id.clone(),
            kind: task.kind,
            status: task.status,
            title: t.title.to_string(),
            message: fill(t.message),
            action_link: t
                .link
                .map(|l| format!("{}{}", self.config.link_base.trim_end_matches('/'), fill(l))),
            read: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// 任务首次进入终态时调用；失败只记录日志
    pub async fn on_terminal(&self, task: &Task) {
        let Some(notification) = self.render(task) else {
            tracing::debug!("Skip notification for non-terminal task {}", task.id);
            return;
        };
        match self.sink.deliver(notification).await {
            Ok(()) => tracing::info!("Notified {} about {} ({})", task.owner_id, task.id, task.status),
            Err(e) => tracing::warn!("Failed to notify {} about {}: {}", task.owner_id, task.id, e),
        }
    }
}
