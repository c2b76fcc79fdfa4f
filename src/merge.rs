//! 差异比较与合并
//!
//! 纯函数：相同输入总得到相同输出，不做任何 I/O。
//!
//! ## 判定规则
//!
//! 对每个本地任务（按本地顺序）：
//! - 远端不存在：保留（`prune_missing` 时删除）
//! - 两侧内容一致：未变
//! - 只有一侧相对基线发生变化：采用变化的一侧
//! - 没有基线：视为远端变更，采用远端
//! - 两侧各自变化：产生冲突，按 `ConflictPolicy` 处理
//!
//! 基线分两份：本地侧与上一次合并结果比较，远端侧与上一次读到的远端比较。
//! 基线存在但不含某个 ID 时，视为两侧各自新建了该任务。
//!
//! 远端独有的任务按远端顺序追加；不允许新增时计入未变。每个 ID 只会落入一个计数桶。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::models::{TaskCollection, TaskId, TaskRecord};

/// 冲突处理策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// `updated_at` 较新的一方胜出；相同或缺失时保留本地
    #[default]
    NewerWins,
    LocalWins,
    RemoteWins,
    /// 保留本地，并将冲突交给 ConflictStore 等待人工处理
    Manual,
    /// 任何冲突都使整个合并失败
    Strict,
}

/// 冲突最终采用的一方
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    KeptLocal,
    TookRemote,
    /// 暂时保留本地，等待人工处理
    Deferred,
}

/// 合并参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergePolicy {
    pub conflict_policy: ConflictPolicy,
    pub allow_additions: bool,
    pub prune_missing: bool,
    /// 存在未解决离线冲突的任务，保持本地、不参与自动合并
    pub blocked: HashSet<TaskRef>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::NewerWins,
            allow_additions: true,
            prune_missing: false,
            blocked: HashSet::new(),
        }
    }
}

/// (tag, id) 定位一条任务
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRef {
    pub tag: String,
    pub id: TaskId,
}

impl TaskRef {
    pub fn new(tag: impl Into<String>, id: impl Into<TaskId>) -> Self {
        Self {
            tag: tag.into(),
            id: id.into(),
        }
    }

    /// `tag#id` 形式的实体 ID，与 ConflictStore 的 `entity_id` 对应
    pub fn entity_id(&self) -> String {
        format!("{}#{}", self.tag, self.id)
    }

    pub fn parse_entity_id(raw: &str) -> Option<Self> {
        let (tag, id) = raw.rsplit_once('#')?;
        if tag.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(tag, id))
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tag, self.id)
    }
}

/// 冲突描述
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDescriptor {
    pub task_id: TaskId,
    pub tag: String,
    pub local_version: TaskRecord,
    pub remote_version: TaskRecord,
    /// 两侧各自变化的字段
    pub reason: Vec<String>,
    pub resolution: ConflictResolution,
}

impl ConflictDescriptor {
    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(self.tag.clone(), self.task_id.clone())
    }
}

/// 合并后无法解析的依赖
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DanglingDependency {
    pub tag: String,
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<TaskId>,
    pub dependency: TaskId,
}

impl fmt::Display for DanglingDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subtask_id {
            Some(sub) => write!(
                f,
                "{}#{}.{} depends on missing {}",
                self.tag, self.task_id, sub, self.dependency
            ),
            None => write!(
                f,
                "{}#{} depends on missing {}",
                self.tag, self.task_id, self.dependency
            ),
        }
    }
}

/// 合并结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub tasks: TaskCollection,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub added_ids: Vec<TaskRef>,
    pub updated_ids: Vec<TaskRef>,
    pub removed_ids: Vec<TaskRef>,
    pub unchanged_ids: Vec<TaskRef>,
    pub conflicts: Vec<ConflictDescriptor>,
    pub dangling_dependencies: Vec<DanglingDependency>,
}

impl MergeResult {
    /// 人类可读的一行摘要
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} added, {} updated, {} removed, {} unchanged",
            self.added, self.updated, self.removed, self.unchanged
        );
        if !self.conflicts.is_empty() {
            out.push_str(&format!(" ({} conflicts)", self.conflicts.len()));
        }
        if !self.dangling_dependencies.is_empty() {
            out.push_str(&format!(
                " ({} dangling dependencies)",
                self.dangling_dependencies.len()
            ));
        }
        out
    }

    /// 是否会改变本地文件
    pub fn has_changes(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }

    fn count(&mut self, bucket: Bucket, task: TaskRef) {
        match bucket {
            Bucket::Added => {
                self.added += 1;
                self.added_ids.push(task);
            }
            Bucket::Updated => {
                self.updated += 1;
                self.updated_ids.push(task);
            }
            Bucket::Removed => {
                self.removed += 1;
                self.removed_ids.push(task);
            }
            Bucket::Unchanged => {
                self.unchanged += 1;
                self.unchanged_ids.push(task);
            }
        }
    }
}

/// 上一次成功同步留下的基线
#[derive(Debug, Clone, Copy)]
pub struct MergeBaseline<'a> {
    /// 上一次写入本地的合并结果
    pub merged: &'a TaskCollection,
    /// 上一次读取到的远端集合
    pub remote: &'a TaskCollection,
}

impl<'a> MergeBaseline<'a> {
    pub fn new(merged: &'a TaskCollection, remote: &'a TaskCollection) -> Self {
        Self { merged, remote }
    }

    /// 两侧共用同一份基线（旧记录没有远端快照时使用）
    pub fn shared(base: &'a TaskCollection) -> Self {
        Self::new(base, base)
    }
}

type TaskIndex<'a> = HashMap<&'a TaskId, &'a TaskRecord>;

fn index(tasks: &[TaskRecord]) -> TaskIndex<'_> {
    tasks.iter().map(|t| (&t.id, t)).collect()
}

#[derive(Clone, Copy)]
enum Bucket {
    Added,
    Updated,
    Removed,
    Unchanged,
}

/// 合并本地与远端集合
///
/// `baseline` 用于区分单侧变化与双侧冲突；为 `None` 时远端的差异一律视为远端变更。
pub fn merge(
    local: &TaskCollection,
    remote: &TaskCollection,
    baseline: Option<MergeBaseline<'_>>,
    policy: &MergePolicy,
) -> SyncResult<MergeResult> {
    let mut result = MergeResult::default();
    let tags: BTreeSet<&str> = local.tags().chain(remote.tags()).collect();

    for tag in tags {
        let local_tasks = local.tasks(tag);
        let remote_tasks = remote.tasks(tag);
        let remote_index = index(remote_tasks);
        let base_index: Option<(TaskIndex<'_>, TaskIndex<'_>)> =
            baseline.map(|b| (index(b.merged.tasks(tag)), index(b.remote.tasks(tag))));

        let mut merged: Vec<TaskRecord> = Vec::with_capacity(local_tasks.len());
        let mut seen: HashSet<&TaskId> = HashSet::new();

        for local_task in local_tasks {
            if !seen.insert(&local_task.id) {
                continue;
            }
            let task_ref = TaskRef::new(tag, local_task.id.clone());

            if policy.blocked.contains(&task_ref) {
                debug!("[Merger] 任务 {} 存在未解决冲突，保持本地", task_ref);
                merged.push(local_task.clone());
                result.count(Bucket::Unchanged, task_ref);
                continue;
            }

            let Some(remote_task) = remote_index.get(&local_task.id).copied() else {
                if policy.prune_missing {
                    result.count(Bucket::Removed, task_ref);
                } else {
                    merged.push(local_task.clone());
                    result.count(Bucket::Unchanged, task_ref);
                }
                continue;
            };

            if local_task.content_eq(remote_task) {
                merged.push(local_task.clone());
                result.count(Bucket::Unchanged, task_ref);
                continue;
            }

            let (local_changed, remote_changed) = match &base_index {
                None => (false, true),
                Some((merged_base, remote_base)) => (
                    merged_base
                        .get(&local_task.id)
                        .map_or(true, |base| !local_task.content_eq(base)),
                    remote_base
                        .get(&local_task.id)
                        .map_or(true, |base| !remote_task.content_eq(base)),
                ),
            };

            match (local_changed, remote_changed) {
                (false, true) => {
                    merged.push(remote_task.clone());
                    result.count(Bucket::Updated, task_ref);
                }
                (true, false) | (false, false) => {
                    merged.push(local_task.clone());
                    result.count(Bucket::Unchanged, task_ref);
                }
                (true, true) => {
                    let resolution = resolve_conflict(policy.conflict_policy, local_task, remote_task);
                    let reason = local_task
                        .changed_fields(remote_task)
                        .into_iter()
                        .map(str::to_string)
                        .collect();
                    result.conflicts.push(ConflictDescriptor {
                        task_id: local_task.id.clone(),
                        tag: tag.to_string(),
                        local_version: local_task.clone(),
                        remote_version: remote_task.clone(),
                        reason,
                        resolution,
                    });
                    if resolution == ConflictResolution::TookRemote {
                        merged.push(remote_task.clone());
                        result.count(Bucket::Updated, task_ref);
                    } else {
                        merged.push(local_task.clone());
                        result.count(Bucket::Unchanged, task_ref);
                    }
                }
            }
        }

        let local_ids: HashSet<&TaskId> = local_tasks.iter().map(|t| &t.id).collect();
        for remote_task in remote_tasks {
            if local_ids.contains(&remote_task.id) || !seen.insert(&remote_task.id) {
                continue;
            }
            let task_ref = TaskRef::new(tag, remote_task.id.clone());
            if policy.blocked.contains(&task_ref) {
                result.count(Bucket::Unchanged, task_ref);
                continue;
            }
            if !policy.allow_additions {
                debug!("[Merger] 不允许新增，跳过远端任务 {}", task_ref);
                result.count(Bucket::Unchanged, task_ref);
                continue;
            }
            merged.push(remote_task.clone());
            result.count(Bucket::Added, task_ref);
        }

        if !local_tasks.is_empty() || !merged.is_empty() {
            result.tasks.set_tag(tag, merged);
        }
    }

    if policy.conflict_policy == ConflictPolicy::Strict && !result.conflicts.is_empty() {
        let ids: Vec<String> = result
            .conflicts
            .iter()
            .map(|c| c.task_ref().to_string())
            .collect();
        warn!("[Merger] 严格模式下检测到 {} 个冲突: {}", ids.len(), ids.join(", "));
        return Err(SyncError::Conflict {
            count: ids.len(),
            ids: ids.join(", "),
        });
    }

    result.dangling_dependencies = find_dangling(&result.tasks);
    for dangling in &result.dangling_dependencies {
        warn!("[Merger] 悬空依赖: {}", dangling);
    }

    info!("[Merger] 合并完成: {}", result.summary());
    Ok(result)
}

fn resolve_conflict(
    policy: ConflictPolicy,
    local: &TaskRecord,
    remote: &TaskRecord,
) -> ConflictResolution {
    match policy {
        ConflictPolicy::LocalWins | ConflictPolicy::Strict => ConflictResolution::KeptLocal,
        ConflictPolicy::RemoteWins => ConflictResolution::TookRemote,
        ConflictPolicy::Manual => ConflictResolution::Deferred,
        ConflictPolicy::NewerWins => match (local.updated_at, remote.updated_at) {
            (Some(l), Some(r)) if r > l => ConflictResolution::TookRemote,
            _ => ConflictResolution::KeptLocal,
        },
    }
}

/// 在各自 tag 内无法解析的依赖
///
/// 子任务的依赖可以指向同级子任务、同 tag 的任务，或 `parent.child` 形式的其他子任务。
fn find_dangling(tasks: &TaskCollection) -> Vec<DanglingDependency> {
    let mut out = Vec::new();
    for (tag, records) in tasks.iter() {
        let ids: HashSet<&TaskId> = records.iter().map(|t| &t.id).collect();
        for task in records {
            for dep in &task.dependencies {
                if !ids.contains(dep) {
                    out.push(DanglingDependency {
                        tag: tag.to_string(),
                        task_id: task.id.clone(),
                        subtask_id: None,
                        dependency: dep.clone(),
                    });
                }
            }
            let sibling_ids: HashSet<&TaskId> = task.subtasks.iter().map(|s| &s.id).collect();
            for sub in &task.subtasks {
                for dep in &sub.dependencies {
                    let resolved = sibling_ids.contains(dep)
                        || ids.contains(dep)
                        || dep.as_str().split_once('.').map_or(false, |(parent, child)| {
                            records.iter().any(|t| {
                                t.id.as_str() == parent
                                    && t.subtasks.iter().any(|s| s.id.as_str() == child)
                            })
                        });
                    if !resolved {
                        out.push(DanglingDependency {
                            tag: tag.to_string(),
                            task_id: task.id.clone(),
                            subtask_id: Some(sub.id.clone()),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }
    }
    out
}
