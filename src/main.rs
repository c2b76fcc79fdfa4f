//! task-sync 命令入口
//!
//! 从 stdin 读取一条 JSON 命令，例如
//! `{"op":"merge","projectId":"p1","userId":"u1","remoteTasks":{...}}`，
//! 执行后把结果以 JSON 打印到 stdout。失败时打印 `{"error":{code,class,message}}`
//! 并以非零状态退出。第一个命令行参数可指定配置文件路径。

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use task_sync::conflicts::ResolutionStrategy;
use task_sync::logging::init_tracing;
use task_sync::source::SshReader;
use task_sync::{
    EventBroadcaster, MergeRequest, SyncConfig, SyncCoordinator, SyncError, SyncRequest, SyncStore,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Command {
    Merge(MergeRequest),
    Sync(SyncRequest),
    #[serde(rename_all = "camelCase")]
    Rollback {
        project_id: String,
        user_id: String,
        backup_path: PathBuf,
    },
    #[serde(rename_all = "camelCase")]
    Scan { user_id: String },
    #[serde(rename_all = "camelCase")]
    Resolve {
        project_id: String,
        user_id: String,
        conflict_id: String,
        strategy: ResolutionStrategy,
        #[serde(default)]
        merged: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    History {
        project_id: String,
        #[serde(default = "default_history_limit")]
        limit: usize,
    },
    #[serde(rename_all = "camelCase")]
    Backups { project_id: String, user_id: String },
}

const DEFAULT_LOG_FILTER: &str = "info";

fn default_history_limit() -> usize {
    20
}

async fn execute(coordinator: &SyncCoordinator, command: Command) -> Result<Value, SyncError> {
    let value = match command {
        Command::Merge(request) => serde_json::to_value(coordinator.merge(request).await?)?,
        Command::Sync(request) => serde_json::to_value(coordinator.sync(request).await?)?,
        Command::Rollback {
            project_id,
            user_id,
            backup_path,
        } => serde_json::to_value(
            coordinator
                .rollback(&project_id, &user_id, &backup_path)
                .await?,
        )?,
        Command::Scan { user_id } => serde_json::to_value(coordinator.scan(&user_id).await?)?,
        Command::Resolve {
            project_id,
            user_id,
            conflict_id,
            strategy,
            merged,
        } => serde_json::to_value(
            coordinator
                .resolve_conflict(&project_id, &user_id, &conflict_id, strategy, merged)
                .await?,
        )?,
        Command::History { project_id, limit } => {
            serde_json::to_value(coordinator.history(&project_id, limit).await?)?
        }
        Command::Backups {
            project_id,
            user_id,
        } => serde_json::to_value(coordinator.list_backups(&project_id, &user_id).await?)?,
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 先用默认指令初始化日志，加载配置时的输出才不会丢失
    let log = init_tracing(DEFAULT_LOG_FILTER);
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::from_env_and_file(config_path.as_deref().map(Path::new))
        .context("加载配置失败")?;
    if let Some(log) = &log {
        log.apply(&config.log_filter);
    }

    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("读取 stdin 失败")?;
    let command: Command = serde_json::from_str(&raw).context("命令不是合法的 JSON")?;

    let store = SyncStore::open(&config.database_path).context("打开同步数据库失败")?;
    let events = Arc::new(EventBroadcaster::new(config.broadcaster.clone()));
    let remote = SshReader::new(Arc::new(config.ssh.shell()), config.ssh.read_timeout);
    let coordinator = SyncCoordinator::new(
        config.coordinator.clone(),
        store,
        Arc::new(config.project_directory()),
        Arc::new(remote),
        events.clone(),
    );

    let result = execute(&coordinator, command).await;
    events.stop();
    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            info!("[task-sync] 命令执行完成");
            Ok(())
        }
        Err(e) => {
            error!("[task-sync] 命令执行失败 [{}]: {}", e.code(), e);
            println!("{}", serde_json::to_string_pretty(&json!({ "error": e.to_payload() }))?);
            std::process::exit(1);
        }
    }
}
