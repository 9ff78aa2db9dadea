//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__WORKER__BASE_URL=http://ai:8000`）。
//! 配置只在进程启动时加载一次，再以结构体形式注入各组件构造函数。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::TaskKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub worker: WorkerSection,
    pub retry: RetrySection,
    pub reconcile: ReconcileSection,
    pub fallback: FallbackSection,
    pub tokens: TokenSection,
    pub notifications: NotificationSection,
    pub store: StoreSection,
}

/// [worker] 段：Worker 地址与各类调用的超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub base_url: String,
    pub commit_summary_timeout_secs: u64,
    pub meeting_qa_timeout_secs: u64,
    pub action_items_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub job_status_timeout_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            commit_summary_timeout_secs: 30,
            meeting_qa_timeout_secs: 30,
            action_items_timeout_secs: 30,
            upload_timeout_secs: 30,
            job_status_timeout_secs: 5,
        }
    }
}

impl WorkerSection {
    /// 单次提交调用的超时
    pub fn timeout_for(&self, kind: TaskKind) -> Duration {
        let secs = match kind {
            TaskKind::CommitSummary => self.commit_summary_timeout_secs,
            TaskKind::MeetingQa => self.meeting_qa_timeout_secs,
            TaskKind::ActionItemExtraction => self.action_items_timeout_secs,
            TaskKind::AttachmentUpload => self.upload_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn job_status_timeout(&self) -> Duration {
        Duration::from_secs(self.job_status_timeout_secs)
    }
}

/// [retry] 段：指数退避（initial_backoff_ms 即一个时间单位）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

/// [reconcile] 段：轮询间隔与卡死判定
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    pub poll_interval_ms: u64,
    /// 任务停留在非终态超过该时长即强制置为 Failed
    pub stuck_timeout_secs: u64,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            stuck_timeout_secs: 600,
        }
    }
}

/// 相关片段抽样方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SegmentSampling {
    /// 每次调用随机抽样，同一问题结果不可复现
    #[default]
    Random,
    /// 以问题文本为种子，同一问题结果稳定
    Seeded,
}

/// [fallback] 段：降级回答
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackSection {
    pub confidence: f64,
    pub sampling: SegmentSampling,
    pub max_segments: usize,
    /// 片段索引取值范围 [0, segment_range)
    pub segment_range: usize,
    /// 每个片段对应的秒数（用于推算 suggestedTimestamp）
    pub segment_seconds: u64,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            confidence: 0.75,
            sampling: SegmentSampling::Random,
            max_segments: 3,
            segment_range: 10,
            segment_seconds: 30,
        }
    }
}

/// [tokens] 段：附件下载令牌
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenSection {
    /// HMAC 密钥；未配置时进程启动随机生成（重启后旧令牌失效）
    pub secret: Option<String>,
    pub ttl_secs: u64,
}

impl Default for TokenSection {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_secs: 3600,
        }
    }
}

/// [notifications] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSection {
    /// 通知里 action link 的前缀
    pub link_base: String,
}

impl Default for NotificationSection {
    fn default() -> Self {
        Self {
            link_base: "/dashboard".to_string(),
        }
    }
}

/// [store] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite 文件路径；未设置时使用内存存储
    pub db_path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
