//! Hive - 异步任务编排层
//!
//! 把用户请求（提交摘要、会议问答、行动项抽取、附件上传）交给外部 Worker，
//! 跟踪生命周期、在瞬时故障下重试，并在 Worker 不可达时降级为本地启发式回答。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型、错误类型、关闭信号
//! - **store**: 任务存储（幂等插入 + compare-and-set 状态迁移；内存 / SQLite）
//! - **transport**: 出站传输与有界指数退避重试
//! - **worker**: Worker 端点客户端与应答解析
//! - **dispatcher**: 任务提交与后台驱动
//! - **reconciler**: 状态对账与轮询
//! - **fallback**: 会议问答的降级回答
//! - **notify**: 终态通知
//! - **token**: 附件下载令牌（HMAC 签名）
//! - **orchestrator**: 组件装配
//! - **api**: HTTP 接口（`server` feature）

#[cfg(feature = "server")]
pub mod api;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod fallback;
pub mod notify;
pub mod observability;
pub mod orchestrator;
pub mod reconciler;
pub mod store;
pub mod token;
pub mod transport;
pub mod worker;

pub use crate::core::{OrchestratorError, Task, TaskKind, TaskStatus};
pub use dispatcher::SubmitOutcome;
pub use orchestrator::{Hive, HiveBuilder};
