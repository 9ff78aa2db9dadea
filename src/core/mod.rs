//! 核心类型：任务模型、错误、关闭信号

pub mod error;
pub mod shutdown;
pub mod task;

pub use error::OrchestratorError;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use task::{
    content_fingerprint, decode_attachment, idempotency_key, sha256_hex, Task, TaskId, TaskKind,
    TaskStatus,
};
