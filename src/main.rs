//! Hive CLI
//!
//! 用法：`hive [--config <path>] <kind> <ownerId> <ownerEntityId> <payload-json | @file>`
//!
//! 提交一个任务，等待其进入终态后以 JSON 打印任务记录。Ctrl+C 中断等待，任务保持非终态。

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hive::config::load_config;
use hive::core::shutdown::drain;
use hive::{observability, Hive, TaskKind};

#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(about = "Submit a task to the worker and wait for its terminal state", long_about = None)]
struct Cli {
    /// 配置文件路径（默认 config/default.toml）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CommitSummary | MeetingQA | ActionItemExtraction | AttachmentUpload
    #[arg(value_parser = parse_kind)]
    kind: TaskKind,

    owner_id: String,

    owner_entity_id: String,

    /// JSON 负载，或以 `@` 开头的文件路径
    payload: String,
}

fn parse_kind(s: &str) -> Result<TaskKind, String> {
    TaskKind::parse(s).ok_or_else(|| format!("unknown task kind '{s}'"))
}

fn read_payload(arg: &str) -> anyhow::Result<serde_json::Value> {
    let raw = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("read {path}"))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&raw).context("payload is not valid JSON")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = Cli::parse();
    let payload = read_payload(&cli.payload)?;
    let cfg = load_config(cli.config).context("Failed to load config")?;
    let stuck = Duration::from_secs(cfg.reconcile.stuck_timeout_secs);

    let hive = Hive::builder(cfg).build().await?;
    hive.shutdown_manager().install_signal_handlers();
    let resumed = hive.resume_in_flight().await?;

    let outcome = hive
        .submit(cli.kind, &cli.owner_id, &cli.owner_entity_id, payload)
        .await
        .context("Submission rejected")?;
    tracing::info!(
        "Task {} ({}){}",
        outcome.task_id,
        outcome.status,
        if outcome.deduplicated { ", reused existing" } else { "" }
    );

    // 留出重试退避与一次轮询的余量
    let budget = stuck + Duration::from_secs(60);
    let result = hive
        .wait_for_terminal(&outcome.task_id, Duration::from_millis(250), budget)
        .await;

    hive.shutdown();
    drain(resumed, Duration::from_secs(5)).await;

    let task = result.context("Task did not reach a terminal state")?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_positionals_and_config() {
        let cli = Cli::try_parse_from([
            "hive",
            "--config",
            "hive.toml",
            "MeetingQA",
            "user_1",
            "meeting_1",
            r#"{"meetingId":"meeting_1","question":"recap?"}"#,
        ])
        .unwrap();
        assert_eq!(cli.kind, TaskKind::MeetingQa);
        assert_eq!(cli.config, Some(PathBuf::from("hive.toml")));
        assert_eq!(read_payload(&cli.payload).unwrap()["question"], "recap?");
    }

    #[test]
    fn test_cli_rejects_unknown_kind_and_missing_args() {
        assert!(Cli::try_parse_from(["hive", "Poetry", "u", "e", "{}"]).is_err());
        assert!(Cli::try_parse_from(["hive", "CommitSummary", "u"]).is_err());
        assert!(read_payload("not json").is_err());
    }
}
