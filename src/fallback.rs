//! 降级回答生成
//!
//! Worker 不可达（重试耗尽）时，为会议问答生成一个启发式回答：
//! 按关键词把问题归入意图类别，套用对应的回答模板，并附上固定的较低置信度。
//!
//! 相关片段（relatedSegments）为有界随机抽样：`sampling = "random"` 时同一问题多次调用结果不同，
//! 不可视为可复现输出；`sampling = "seeded"` 时以问题文本为种子，结果稳定。

use std::sync::{Arc, OnceLock};

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::{FallbackSection, SegmentSampling};
use crate::core::{OrchestratorError, Task, TaskStatus};
use crate::notify::NotificationEmitter;
use crate::store::{StatusUpdate, TaskStore, Transition};
use crate::worker::MeetingAnswer;

/// 问题意图类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionIntent {
    ActionItems,
    Decisions,
    Timeline,
    Summary,
    General,
}

fn intent_patterns() -> &'static [(QuestionIntent, Regex)] {
    static PATTERNS: OnceLock<Vec<(QuestionIntent, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                QuestionIntent::ActionItems,
                r"\b(action items?|actions?|tasks?|todos?|to-dos?|to do|follow[- ]?ups?|next steps?|assigned)\b",
            ),
            (
                QuestionIntent::Decisions,
                r"\b(decisions?|decided|decide|conclu(de|ded|sion|sions)|agreed|agreements?|outcomes?|resolved)\b",
            ),
            (
                QuestionIntent::Timeline,
                r"\b(timelines?|deadlines?|due|when|schedules?|dates?|milestones?|by friday|eta)\b",
            ),
            (
                QuestionIntent::Summary,
                r"\b(summary|summari[sz]e|overview|recap|main points?|key points?|highlights?|about|gist|tl;?dr)\b",
            ),
        ]
        .into_iter()
        .filter_map(|(intent, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((intent, re)),
            Err(e) => {
                tracing::error!("Intent pattern for {:?} does not compile: {}", intent, e);
                None
            }
        })
        .collect()
    })
}

/// 任务负载中的问题文本（缺失时为空串）
pub fn question_of(task: &Task) -> &str {
    task.payload
        .get("question")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// 按关键词分类；按 ActionItems → Decisions → Timeline → Summary 的顺序取第一个命中
pub fn classify(question: &str) -> QuestionIntent {
    let lower = question.to_lowercase();
    intent_patterns()
        .iter()
        .find(|(_, re)| re.is_match(&lower))
        .map(|(intent, _)| *intent)
        .unwrap_or(QuestionIntent::General)
}

fn template(intent: QuestionIntent) -> &'static str {
    match intent {
        QuestionIntent::ActionItems => {
            "Based on the meeting discussion, the main action items are to follow up on the open \
             issues raised, assign owners to each deliverable, and confirm next steps before the \
             next sync. Review the related segments for who committed to what."
        }
        QuestionIntent::Decisions => {
            "The meeting appears to have reached conclusions on the main topics discussed. The key \
             decisions were made after reviewing the available options; check the related segments \
             for the exact wording of what was agreed."
        }
        QuestionIntent::Timeline => {
            "Timelines and deadlines were discussed during the meeting. Upcoming milestones were \
             mentioned alongside the tasks they relate to; the related segments point to where dates \
             and due times come up."
        }
        QuestionIntent::Summary => {
            "This meeting covered the team's current progress, open questions, and planned next \
             steps. Participants reviewed recent work, discussed blockers, and aligned on priorities."
        }
        QuestionIntent::General => {
            "The answer service is temporarily unavailable, so this response is based on general \
             meeting structure rather than the transcript. The related segments are likely places \
             to look; please ask again later for a transcript-based answer."
        }
    }
}

/// 降级回答的 `status` 字段，与 Worker 的 "completed" 区分
pub const FALLBACK_STATUS: &str = "fallback";

/// 降级回答生成器
pub struct FallbackSynthesizer {
    config: FallbackSection,
}

impl FallbackSynthesizer {
    pub fn new(config: FallbackSection) -> Self {
        Self { config }
    }

    /// 生成降级回答（纯函数部分，不触碰存储）
    pub fn synthesize(&self, question: &str) -> MeetingAnswer {
        let intent = classify(question);
        let segments = self.sample_segments(question);
        let suggested_timestamp = segments
            .first()
            .map(|i| (*i as u64 * self.config.segment_seconds) as f64);

        MeetingAnswer {
            status: FALLBACK_STATUS.to_string(),
            answer: template(intent).to_string(),
            confidence: self.config.confidence,
            suggested_timestamp,
            related_segments: segments
                .into_iter()
                .map(|i| {
                    json!({
                        "index": i,
                        "startTime": i as u64 * self.config.segment_seconds,
                    })
                })
                .collect(),
            fallback: true,
        }
    }

    /// 从 [0, segment_range) 中无放回抽取 1..=max_segments 个索引，升序返回
    fn sample_segments(&self, question: &str) -> Vec<usize> {
        let range = self.config.segment_range;
        let max = self.config.max_segments.min(range);
        if max == 0 {
            return Vec::new();
        }
        let mut rng = match self.config.sampling {
            SegmentSampling::Random => StdRng::from_entropy(),
            SegmentSampling::Seeded => StdRng::from_seed(seed_for(question)),
        };
        let count = rng.gen_range(1..=max);
        let mut picked = sample(&mut rng, range, count).into_vec();
        picked.sort_unstable();
        picked
    }

    /// 把降级结果以 Failed + result 写入任务；若任务已终态（例如 Worker 已给出真实结果）则不写
    ///
    /// 返回 Some(answer) 表示本次写入生效。
    pub async fn apply(
        &self,
        store: &Arc<dyn TaskStore>,
        notifier: &NotificationEmitter,
        task_id: &str,
        question: &str,
        reason: &str,
    ) -> Result<Option<MeetingAnswer>, OrchestratorError> {
        let answer = self.synthesize(question);
        let result: Value = serde_json::to_value(&answer)
            .map_err(|e| OrchestratorError::Protocol(e.to_string()))?;

        let transition = store
            .transition(task_id, StatusUpdate::failed_with_fallback(result, reason))
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id}")))?;

        match transition {
            Transition::Applied(task) => {
                tracing::warn!(
                    "Worker unavailable for {}, wrote fallback answer (confidence {})",
                    task_id,
                    answer.confidence
                );
                notifier.on_terminal(&task).await;
                Ok(Some(answer))
            }
            other => {
                let current = other.task();
                tracing::debug!(
                    "{}",
                    OrchestratorError::StaleWriteRejected {
                        task_id: task_id.to_string(),
                        from: current.status,
                        to: TaskStatus::Failed,
                    }
                );
                Ok(None)
            }
        }
    }
}

fn seed_for(question: &str) -> [u8; 32] {
    let normalized = question.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&Sha256::digest(normalized.as_bytes()));
    seed
}
