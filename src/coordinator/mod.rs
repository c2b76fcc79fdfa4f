//! # Coordinator 模块
//!
//! 一次同步的完整编排：校验 → 解析项目 → 加锁 → 读取 → 合并 →
//! 备份 → 写入 → 状态与历史 → 广播。
//!
//! 每个 (project_id, user_id, source_kind) 一个状态机：
//! IDLE → RUNNING → {COMPLETED, FAILED}，下一次触发时重新进入 RUNNING。

pub mod engine;
pub mod handler;
pub mod locks;

pub use engine::SyncCoordinator;
pub use handler::CoordinatorJobHandler;
pub use locks::{ProjectLockGuard, ProjectLocks};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::duration_secs;
use crate::merge::{ConflictPolicy, MergeResult};

/// 同一项目并发同步时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    /// 直接返回 `AlreadyRunning`
    #[default]
    Reject,
    /// 在同一把锁上 FIFO 排队
    Queue,
}

/// 协调器参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub concurrency_policy: ConcurrencyPolicy,
    /// 请求未指定时使用的冲突策略
    pub conflict_policy: ConflictPolicy,
    /// 本地与缓存读取的时限；SSH 读取由 `SshReader` 自己限时
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency_policy: ConcurrencyPolicy::Reject,
            conflict_policy: ConflictPolicy::NewerWins,
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// 合并选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeOptions {
    pub dry_run: bool,
    pub prune_missing: bool,
    pub allow_additions: bool,
    pub conflict_policy: Option<ConflictPolicy>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            prune_missing: false,
            allow_additions: true,
            conflict_policy: None,
        }
    }
}

/// 合并请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub project_id: String,
    pub user_id: String,
    /// 内联的远端任务，接受任一历史文件形态；优先于 `use_cached_remote`
    #[serde(default)]
    pub remote_tasks: Option<Value>,
    #[serde(default)]
    pub options: MergeOptions,
    #[serde(default)]
    pub use_cached_remote: bool,
}

impl MergeRequest {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            remote_tasks: None,
            options: MergeOptions::default(),
            use_cached_remote: false,
        }
    }
}

/// 合并结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub result: MergeResult,
    pub summary: String,
    /// 写入前的备份；dry run 或无变化时为空
    pub backup_path: Option<PathBuf>,
    /// dry run 时为空
    pub history_id: Option<String>,
}

/// UI 触发的同步请求，使用项目配置的远端
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub project_id: String,
    pub user_id: String,
    #[serde(default)]
    pub options: MergeOptions,
}

/// 同步报告
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub tasks_imported: usize,
    pub tasks_updated: usize,
    pub tasks_skipped: usize,
    pub errors: Vec<String>,
}

impl From<&MergeResult> for SyncReport {
    fn from(result: &MergeResult) -> Self {
        let mut errors: Vec<String> = result
            .conflicts
            .iter()
            .map(|c| {
                format!(
                    "conflict on {}#{} ({}): {:?}",
                    c.tag,
                    c.task_id,
                    c.reason.join(", "),
                    c.resolution
                )
            })
            .collect();
        errors.extend(
            result
                .dangling_dependencies
                .iter()
                .map(|d| format!("dangling dependency: {}", d)),
        );
        Self {
            tasks_imported: result.added,
            tasks_updated: result.updated,
            tasks_skipped: result.unchanged + result.removed,
            errors,
        }
    }
}

/// 回滚结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    pub project_id: String,
    pub restored_from: PathBuf,
    pub history_id: String,
}

/// 扫描到的单个项目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntry {
    pub project_id: String,
    pub name: String,
    pub tasks_path: PathBuf,
    pub readable: bool,
    pub task_count: usize,
    pub error: Option<String>,
}

/// 扫描报告
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub user_id: String,
    pub projects: Vec<ScanEntry>,
    pub history_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{merge, MergePolicy};
    use crate::models::{TaskCollection, TaskRecord};
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let req: MergeRequest = serde_json::from_value(json!({
            "projectId": "p1",
            "userId": "u1",
            "options": {"dryRun": true, "conflictPolicy": "local-wins"}
        }))
        .unwrap();
        assert!(req.options.dry_run);
        assert!(req.options.allow_additions);
        assert_eq!(req.options.conflict_policy, Some(ConflictPolicy::LocalWins));
        assert!(!req.use_cached_remote);
        assert!(req.remote_tasks.is_none());
    }

    #[test]
    fn test_sync_report_from_merge_result() {
        let local = TaskCollection::from_tasks(
            "master",
            vec![
                TaskRecord::new(1u64, "master", "A"),
                TaskRecord::new(2u64, "master", "B"),
            ],
        );
        let mut changed = TaskRecord::new(1u64, "master", "A2");
        changed.dependencies.push("9".into());
        let remote = TaskCollection::from_tasks(
            "master",
            vec![changed, TaskRecord::new(3u64, "master", "C")],
        );
        let result = merge(&local, &remote, None, &MergePolicy {
            prune_missing: true,
            ..Default::default()
        })
        .unwrap();

        let report = SyncReport::from(&result);
        assert_eq!(report.tasks_imported, 1);
        assert_eq!(report.tasks_updated, 1);
        assert_eq!(report.tasks_skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("dangling dependency"));
    }
}
