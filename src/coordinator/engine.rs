//! 同步协调器
//!
//! 非 dry run 的合并在任何 I/O 之前写入 RUNNING 的历史行与状态，
//! 之后无论成功、失败还是取消，都恰好终结一次。由调度器传入的历史行在失败时
//! 保持 RUNNING，交给调度器在重试耗尽后终结。写入失败或写入后被取消时，
//! 先从备份恢复目标文件（原本不存在则删除），再返回错误。

use chrono::Utc;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    CoordinatorConfig, MergeOptions, MergeOutcome, MergeRequest, ProjectLocks, RollbackOutcome,
    ScanEntry, ScanReport, SyncReport, SyncRequest,
};
use crate::backup::{BackupInfo, BackupManager};
use crate::conflicts::{ConflictStore, ResolutionStrategy, ResolvedConflict};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBroadcaster, SyncEvent, SyncEventType};
use crate::merge::{
    merge, ConflictPolicy, ConflictResolution, MergeBaseline, MergePolicy, MergeResult,
};
use crate::models::TaskCollection;
use crate::source::local::read_document;
use crate::source::{
    parse_document, CachedReader, LocalFileSink, LocalReader, ProjectDescriptor,
    ProjectDirectory, SourceKind, SourceReader, TaskSink,
};
use crate::store::{
    HistoryCounts, HistoryRepository, HistoryStatus, StateRepository, SyncHistoryRow,
    SyncStateKey, SyncStateRecord, SyncStatus, SyncStore, SyncType, SCAN_SCOPE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Merge,
    Sync,
}

impl Operation {
    fn failure_event(&self) -> SyncEventType {
        match self {
            Operation::Merge => SyncEventType::MergeFailed,
            Operation::Sync => SyncEventType::SyncFailed,
        }
    }
}

/// 本次合并的远端来源
enum RemoteSource {
    Inline(TaskCollection),
    Configured,
    Cached,
}

impl RemoteSource {
    /// 内联数据与缓存快照共用 cached 状态行
    fn kind(&self) -> SourceKind {
        match self {
            RemoteSource::Configured => SourceKind::Ssh,
            RemoteSource::Inline(_) | RemoteSource::Cached => SourceKind::Cached,
        }
    }
}

struct MergePlan {
    result: MergeResult,
    /// 本次读到的远端集合，提交后成为下一次的远端基线
    remote: TaskCollection,
    policy: ConflictPolicy,
    target_existed: bool,
}

/// 同步协调器
pub struct SyncCoordinator {
    config: CoordinatorConfig,
    store: SyncStore,
    directory: Arc<dyn ProjectDirectory>,
    local: Arc<dyn SourceReader>,
    remote: Arc<dyn SourceReader>,
    cached: Arc<dyn SourceReader>,
    sink: Arc<dyn TaskSink>,
    backups: BackupManager,
    conflicts: ConflictStore,
    events: Arc<EventBroadcaster>,
    locks: ProjectLocks,
}

impl SyncCoordinator {
    /// `remote` 是项目配置了远程主机时使用的读取器（通常为 `SshReader`）
    pub fn new(
        config: CoordinatorConfig,
        store: SyncStore,
        directory: Arc<dyn ProjectDirectory>,
        remote: Arc<dyn SourceReader>,
        events: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            config,
            local: Arc::new(LocalReader),
            cached: Arc::new(CachedReader::new(store.clone())),
            sink: Arc::new(LocalFileSink),
            backups: BackupManager::new(),
            conflicts: ConflictStore::new(store.clone()),
            locks: ProjectLocks::new(),
            store,
            directory,
            remote,
            events,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TaskSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_local_reader(mut self, reader: Arc<dyn SourceReader>) -> Self {
        self.local = reader;
        self
    }

    pub fn conflicts(&self) -> &ConflictStore {
        &self.conflicts
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // 对外操作
    // ------------------------------------------------------------------

    /// 合并端点
    pub async fn merge(&self, request: MergeRequest) -> SyncResult<MergeOutcome> {
        let cancel = CancellationToken::new();
        self.run(Operation::Merge, request, None, &cancel).await
    }

    /// 带取消令牌的合并；`history_id` 给出时终结该行而不是新建
    pub async fn merge_with(
        &self,
        request: MergeRequest,
        history_id: Option<String>,
        cancel: &CancellationToken,
    ) -> SyncResult<MergeOutcome> {
        self.run(Operation::Merge, request, history_id, cancel).await
    }

    /// UI 同步触发：使用项目配置的远端，没有远端时使用缓存快照
    pub async fn sync(&self, request: SyncRequest) -> SyncResult<SyncReport> {
        let cancel = CancellationToken::new();
        self.sync_with(request, None, &cancel).await
    }

    pub async fn sync_with(
        &self,
        request: SyncRequest,
        history_id: Option<String>,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncReport> {
        let merge_request = MergeRequest {
            project_id: request.project_id,
            user_id: request.user_id,
            remote_tasks: None,
            options: request.options,
            use_cached_remote: false,
        };
        let outcome = self
            .run(Operation::Sync, merge_request, history_id, cancel)
            .await?;
        Ok(SyncReport::from(&outcome.result))
    }

    /// 从备份恢复项目任务文件；不依赖本进程内之前的同步
    pub async fn rollback(
        &self,
        project_id: &str,
        user_id: &str,
        backup_path: &Path,
    ) -> SyncResult<RollbackOutcome> {
        validate_ids(project_id, user_id)?;
        let project = self.directory.resolve(project_id, user_id).await?;
        let target = project.tasks_path();
        if !self.backups.is_backup_of(backup_path, &target) {
            return Err(SyncError::validation(format!(
                "{} 不是项目 {} 任务文件的备份",
                backup_path.display(),
                project_id
            )));
        }
        match tokio::fs::metadata(backup_path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(SyncError::validation(format!(
                    "备份路径不是文件: {}",
                    backup_path.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::not_found(format!(
                    "备份文件不存在: {}",
                    backup_path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        }

        let _lock = self
            .locks
            .acquire(project_id, &target, self.config.concurrency_policy)
            .await?;

        let (pid, uid) = (project_id.to_string(), user_id.to_string());
        let history_id = self
            .store
            .call(move |conn| HistoryRepository::create_running(conn, &pid, &uid, SyncType::Rollback))
            .await?;
        info!(
            "[SyncCoordinator] 开始回滚项目 {}: {}",
            project_id,
            backup_path.display()
        );

        let restore = {
            let backups = self.backups.clone();
            let (backup, target) = (backup_path.to_path_buf(), target.clone());
            tokio::task::spawn_blocking(move || backups.restore(&backup, &target))
                .await
                .map_err(SyncError::from)
                .and_then(|r| r)
        };

        let committed = match restore {
            Ok(()) => {
                let (pid, uid, hid) = (
                    project_id.to_string(),
                    user_id.to_string(),
                    history_id.clone(),
                );
                self.store
                    .call(move |conn| {
                        let tx = conn.unchecked_transaction()?;
                        StateRepository::reset_to_idle(&tx, &pid, &uid)?;
                        HistoryRepository::finalize(
                            &tx,
                            &hid,
                            HistoryStatus::Completed,
                            HistoryCounts::default(),
                            None,
                            None,
                        )?;
                        tx.commit()?;
                        Ok(())
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        match committed {
            Ok(()) => {
                info!("[SyncCoordinator] 项目 {} 回滚完成", project_id);
                self.emit(
                    SyncEventType::MergeRollback,
                    project_id,
                    json!({
                        "historyId": history_id,
                        "backupPath": backup_path,
                    }),
                    true,
                );
                Ok(RollbackOutcome {
                    project_id: project_id.to_string(),
                    restored_from: backup_path.to_path_buf(),
                    history_id,
                })
            }
            Err(e) => {
                error!("[SyncCoordinator] 项目 {} 回滚失败: {}", project_id, e);
                self.finalize_failed(&history_id, &e).await;
                self.emit_failure(SyncEventType::MergeFailed, project_id, &history_id, &e);
                Err(e)
            }
        }
    }

    /// 发现用户可见的项目并检查各自任务文件是否可读
    pub async fn scan(&self, user_id: &str) -> SyncResult<ScanReport> {
        let cancel = CancellationToken::new();
        self.scan_with(user_id, None, &cancel).await
    }

    pub async fn scan_with(
        &self,
        user_id: &str,
        history_id: Option<String>,
        cancel: &CancellationToken,
    ) -> SyncResult<ScanReport> {
        if user_id.trim().is_empty() {
            return Err(SyncError::validation("user_id 不能为空"));
        }
        let projects = self.directory.list_for_user(user_id).await?;
        let owns_history = history_id.is_none();
        let history_id = match history_id {
            Some(id) => id,
            None => {
                let uid = user_id.to_string();
                self.store
                    .call(move |conn| {
                        HistoryRepository::create_running(conn, SCAN_SCOPE, &uid, SyncType::Scan)
                    })
                    .await?
            }
        };

        let mut entries = Vec::with_capacity(projects.len());
        for project in &projects {
            if cancel.is_cancelled() {
                let err = SyncError::Cancelled("扫描已取消".into());
                if owns_history {
                    self.finalize_failed(&history_id, &err).await;
                }
                return Err(err);
            }
            entries.push(self.scan_project(project).await);
        }

        let hid = history_id.clone();
        let finalized = self
            .store
            .call(move |conn| {
                HistoryRepository::finalize(
                    conn,
                    &hid,
                    HistoryStatus::Completed,
                    HistoryCounts::default(),
                    None,
                    None,
                )
            })
            .await;
        if let Err(e) = finalized {
            if owns_history {
                self.finalize_failed(&history_id, &e).await;
            }
            return Err(e);
        }

        for entry in &entries {
            self.emit(
                SyncEventType::ScanCompleted,
                &entry.project_id,
                serde_json::to_value(entry).unwrap_or(Value::Null),
                false,
            );
        }
        info!(
            "[SyncCoordinator] 用户 {} 扫描完成: {} 个项目，{} 个可读",
            user_id,
            entries.len(),
            entries.iter().filter(|e| e.readable).count()
        );
        Ok(ScanReport {
            user_id: user_id.to_string(),
            projects: entries,
            history_id,
        })
    }

    /// 解决离线冲突，并把结果写回本地任务文件
    pub async fn resolve_conflict(
        &self,
        project_id: &str,
        user_id: &str,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        merged_payload: Option<Value>,
    ) -> SyncResult<ResolvedConflict> {
        validate_ids(project_id, user_id)?;
        let project = self.directory.resolve(project_id, user_id).await?;
        let target = project.tasks_path();
        let _lock = self
            .locks
            .acquire(project_id, &target, self.config.concurrency_policy)
            .await?;

        let item = self
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| SyncError::not_found(format!("冲突不存在: {}", conflict_id)))?;
        if item.project_id != project_id {
            warn!(
                "[SyncCoordinator] 冲突 {} 属于项目 {}，拒绝在项目 {} 中解决",
                conflict_id, item.project_id, project_id
            );
            return Err(SyncError::validation(format!(
                "冲突 {} 不属于项目 {}",
                conflict_id, project_id
            )));
        }
        if item.resolved {
            return Err(SyncError::validation(format!("冲突 {} 已解决", conflict_id)));
        }
        let payload = match strategy {
            ResolutionStrategy::Local => item.local_data.clone(),
            ResolutionStrategy::Remote => item.remote_data.clone(),
            ResolutionStrategy::Merged => merged_payload.clone().ok_or_else(|| {
                SyncError::validation("merged 解决方式必须提供合并后的数据")
            })?,
        };
        let preview = ResolvedConflict {
            item: item.clone(),
            payload,
        };

        let cancel = CancellationToken::new();
        let (mut local, existed) = match self.read_local(&project, user_id, &cancel).await {
            Ok(collection) => (collection, true),
            Err(SyncError::NotFound(_)) => (TaskCollection::new(), false),
            Err(e) => return Err(e),
        };
        preview.apply_to(&mut local)?;

        let backup = if existed {
            Some(self.snapshot(&target).await?)
        } else {
            None
        };
        if let Err(e) = self.sink.write(&target, &local).await {
            self.undo_write(&target, backup.as_deref()).await;
            return Err(e);
        }
        match self
            .conflicts
            .resolve(conflict_id, strategy, merged_payload)
            .await
        {
            Ok(resolved) => {
                self.emit(
                    SyncEventType::TaskUpdate,
                    project_id,
                    json!({
                        "conflictId": conflict_id,
                        "entityId": resolved.item.entity_id,
                        "resolution": strategy.as_str(),
                    }),
                    true,
                );
                Ok(resolved)
            }
            Err(e) => {
                self.undo_write(&target, backup.as_deref()).await;
                Err(e)
            }
        }
    }

    /// 某个来源的同步状态
    pub async fn sync_state(
        &self,
        project_id: &str,
        user_id: &str,
        source_kind: SourceKind,
    ) -> SyncResult<SyncStateRecord> {
        let key = SyncStateKey::new(project_id, user_id, source_kind);
        self.store
            .call(move |conn| StateRepository::load(conn, &key))
            .await
    }

    /// 项目最近的同步历史
    pub async fn history(&self, project_id: &str, limit: usize) -> SyncResult<Vec<SyncHistoryRow>> {
        let project_id = project_id.to_string();
        self.store
            .call(move |conn| HistoryRepository::list_for_project(conn, &project_id, limit))
            .await
    }

    /// 项目任务文件的备份列表，最新的在前
    pub async fn list_backups(&self, project_id: &str, user_id: &str) -> SyncResult<Vec<BackupInfo>> {
        validate_ids(project_id, user_id)?;
        let project = self.directory.resolve(project_id, user_id).await?;
        let target = project.tasks_path();
        let backups = self.backups.clone();
        tokio::task::spawn_blocking(move || backups.list_backups(&target)).await?
    }

    // ------------------------------------------------------------------
    // 合并流程
    // ------------------------------------------------------------------

    fn validate(request: &MergeRequest) -> SyncResult<()> {
        validate_ids(&request.project_id, &request.user_id)?;
        if request.options.prune_missing
            && request.use_cached_remote
            && request.remote_tasks.is_none()
        {
            return Err(SyncError::validation(
                "prune_missing 不能与 use_cached_remote 同时使用",
            ));
        }
        Ok(())
    }

    fn remote_source(request: &MergeRequest, project: &ProjectDescriptor) -> SyncResult<RemoteSource> {
        if let Some(raw) = &request.remote_tasks {
            let bytes = serde_json::to_vec(raw)?;
            let parsed = parse_document(&bytes)
                .map_err(|e| SyncError::validation(format!("remote_tasks 无法解析: {}", e)))?;
            return Ok(RemoteSource::Inline(parsed.collection));
        }
        if request.use_cached_remote || project.remote.is_none() {
            return Ok(RemoteSource::Cached);
        }
        Ok(RemoteSource::Configured)
    }

    async fn run(
        &self,
        operation: Operation,
        request: MergeRequest,
        history_id: Option<String>,
        cancel: &CancellationToken,
    ) -> SyncResult<MergeOutcome> {
        Self::validate(&request)?;
        let project = self
            .directory
            .resolve(&request.project_id, &request.user_id)
            .await?;
        let remote = Self::remote_source(&request, &project)?;
        let key = SyncStateKey::new(&project.project_id, &request.user_id, remote.kind());
        let target = project.tasks_path();
        let _lock = self
            .locks
            .acquire(&project.project_id, &target, self.config.concurrency_policy)
            .await?;

        if request.options.dry_run {
            let plan = self
                .plan(&project, &request.user_id, &request.options, &remote, &key, cancel)
                .await?;
            info!(
                "[SyncCoordinator] 项目 {} dry run: {}",
                project.project_id,
                plan.result.summary()
            );
            return Ok(MergeOutcome {
                summary: plan.result.summary(),
                result: plan.result,
                backup_path: None,
                history_id: None,
            });
        }

        // 外部传入的历史行由调用方在全部重试结束后兜底终结
        let owns_history = history_id.is_none();
        let history_id = self.begin(&key, history_id).await?;
        info!(
            "[SyncCoordinator] 开始同步项目 {} (source={}, history={})",
            project.project_id,
            key.source_kind.as_str(),
            history_id
        );
        self.emit(
            SyncEventType::SyncStarted,
            &project.project_id,
            json!({
                "historyId": history_id,
                "source": key.source_kind.as_str(),
            }),
            false,
        );

        let outcome = self
            .execute(&project, &request, &remote, &key, &history_id, &target, cancel)
            .await;
        match outcome {
            Ok(outcome) => {
                self.emit_success(&project.project_id, &outcome);
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    "[SyncCoordinator] 项目 {} 同步失败 [{}]: {}",
                    project.project_id,
                    e.code(),
                    e
                );
                let message = e.to_string();
                let state_key = key.clone();
                if let Err(db_err) = self
                    .store
                    .call(move |conn| {
                        StateRepository::set_status(
                            conn,
                            &state_key,
                            SyncStatus::Failed,
                            Some(&message),
                        )
                    })
                    .await
                {
                    error!("[SyncCoordinator] 写入失败状态出错: {}", db_err);
                }
                if owns_history {
                    self.finalize_failed(&history_id, &e).await;
                }
                self.emit_failure(
                    operation.failure_event(),
                    &project.project_id,
                    &history_id,
                    &e,
                );
                Err(e)
            }
        }
    }

    /// 建立（或接管）RUNNING 历史行并把状态置为 RUNNING
    async fn begin(&self, key: &SyncStateKey, history_id: Option<String>) -> SyncResult<String> {
        let key = key.clone();
        self.store
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let id = match history_id {
                    Some(id) => id,
                    None => HistoryRepository::create_running(
                        &tx,
                        &key.project_id,
                        &key.user_id,
                        SyncType::Merge,
                    )?,
                };
                StateRepository::set_status(&tx, &key, SyncStatus::Running, None)?;
                tx.commit()?;
                Ok(id)
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        project: &ProjectDescriptor,
        request: &MergeRequest,
        remote: &RemoteSource,
        key: &SyncStateKey,
        history_id: &str,
        target: &Path,
        cancel: &CancellationToken,
    ) -> SyncResult<MergeOutcome> {
        let plan = self
            .plan(project, &request.user_id, &request.options, remote, key, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled("同步在写入前被取消".into()));
        }

        let wrote = plan.result.has_changes();
        let mut backup_path = None;
        if wrote {
            if plan.target_existed {
                backup_path = Some(self.snapshot(target).await?);
            }
            let written = match self.sink.write(target, &plan.result.tasks).await {
                Ok(()) if cancel.is_cancelled() => {
                    Err(SyncError::Cancelled("同步在写入后被取消".into()))
                }
                other => other,
            };
            if let Err(e) = written {
                self.undo_write(target, backup_path.as_deref()).await;
                return Err(e);
            }
        } else {
            debug!("[SyncCoordinator] 项目 {} 没有变化，跳过写入", project.project_id);
        }

        if let Err(e) = self.commit(key, history_id, &plan).await {
            if wrote {
                self.undo_write(target, backup_path.as_deref()).await;
            }
            return Err(e);
        }

        info!(
            "[SyncCoordinator] 项目 {} 同步完成: {}",
            project.project_id,
            plan.result.summary()
        );
        Ok(MergeOutcome {
            summary: plan.result.summary(),
            result: plan.result,
            backup_path,
            history_id: Some(history_id.to_string()),
        })
    }

    /// 读取两侧并在内存中合并，不产生任何副作用
    async fn plan(
        &self,
        project: &ProjectDescriptor,
        user_id: &str,
        options: &MergeOptions,
        remote: &RemoteSource,
        key: &SyncStateKey,
        cancel: &CancellationToken,
    ) -> SyncResult<MergePlan> {
        let (local, target_existed) = match self.read_local(project, user_id, cancel).await {
            Ok(collection) => (collection, true),
            Err(SyncError::NotFound(_)) => {
                debug!(
                    "[SyncCoordinator] 项目 {} 本地任务文件不存在，按空集合处理",
                    project.project_id
                );
                (TaskCollection::new(), false)
            }
            Err(e) => return Err(e),
        };

        let remote_tasks = match remote {
            RemoteSource::Inline(collection) => collection.clone(),
            RemoteSource::Configured => {
                self.read_with_timeout(self.remote.as_ref(), project, user_id, cancel)
                    .await?
            }
            RemoteSource::Cached => {
                self.read_with_timeout(self.cached.as_ref(), project, user_id, cancel)
                    .await?
            }
        };

        let state_key = key.clone();
        let state = self
            .store
            .call(move |conn| StateRepository::load(conn, &state_key))
            .await?;
        let blocked = self.conflicts.blocked_ids(&project.project_id).await?;
        // 旧状态行没有远端基线时两侧共用合并结果
        let baseline = match (&state.sync_data, &state.remote_baseline) {
            (Some(merged), Some(seen)) => Some(MergeBaseline::new(merged, seen)),
            (Some(merged), None) => Some(MergeBaseline::shared(merged)),
            (None, _) => None,
        };

        let policy = MergePolicy {
            conflict_policy: options
                .conflict_policy
                .unwrap_or(self.config.conflict_policy),
            allow_additions: options.allow_additions,
            prune_missing: options.prune_missing,
            blocked,
        };
        let result = merge(&local, &remote_tasks, baseline, &policy)?;
        Ok(MergePlan {
            result,
            remote: remote_tasks,
            policy: policy.conflict_policy,
            target_existed,
        })
    }

    /// 状态、历史与待人工处理的冲突在同一事务内提交
    async fn commit(&self, key: &SyncStateKey, history_id: &str, plan: &MergePlan) -> SyncResult<()> {
        let deferred: Vec<(String, Value, Value)> = if plan.policy == ConflictPolicy::Manual {
            plan.result
                .conflicts
                .iter()
                .filter(|c| c.resolution == ConflictResolution::Deferred)
                .map(|c| -> SyncResult<(String, Value, Value)> {
                    Ok((
                        c.task_ref().entity_id(),
                        serde_json::to_value(&c.local_version)?,
                        serde_json::to_value(&c.remote_version)?,
                    ))
                })
                .collect::<SyncResult<_>>()?
        } else {
            Vec::new()
        };
        let counts = HistoryCounts {
            added: plan.result.added,
            updated: plan.result.updated,
            removed: plan.result.removed,
        };
        let snapshot = plan.result.tasks.clone();
        let remote_baseline = plan.remote.clone();
        let key = key.clone();
        let hid = history_id.to_string();

        let recorded = self
            .store
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                for (entity_id, local, remote) in &deferred {
                    ConflictStore::record_blocking(&tx, &key.project_id, entity_id, local, remote)?;
                }
                StateRepository::save(
                    &tx,
                    &key,
                    &SyncStateRecord {
                        status: SyncStatus::Completed,
                        last_sync_at: Some(Utc::now()),
                        error_message: None,
                        sync_data: Some(snapshot.clone()),
                        remote_baseline: Some(remote_baseline),
                    },
                )?;
                if !HistoryRepository::finalize(
                    &tx,
                    &hid,
                    HistoryStatus::Completed,
                    counts,
                    Some(&snapshot),
                    None,
                )? {
                    return Err(SyncError::database(format!("历史行 {} 已被终结", hid)));
                }
                tx.commit()?;
                Ok(deferred.len())
            })
            .await?;
        if recorded > 0 {
            info!("[SyncCoordinator] 已记录 {} 个待人工处理的冲突", recorded);
        }
        Ok(())
    }

    async fn read_local(
        &self,
        project: &ProjectDescriptor,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<TaskCollection> {
        self.read_with_timeout(self.local.as_ref(), project, user_id, cancel)
            .await
    }

    /// SSH 读取器自己负责超时，超时后仍会关闭会话；其他来源由这里限时
    async fn read_with_timeout(
        &self,
        reader: &dyn SourceReader,
        project: &ProjectDescriptor,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<TaskCollection> {
        if reader.kind() == SourceKind::Ssh {
            return reader.read(project, user_id, cancel).await;
        }
        let timeout = self.config.read_timeout;
        match tokio::time::timeout(timeout, reader.read(project, user_id, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::timeout(
                format!("读取 {} 任务 ({})", reader.kind().as_str(), project.project_id),
                timeout.as_secs(),
            )),
        }
    }

    async fn snapshot(&self, target: &Path) -> SyncResult<PathBuf> {
        let backups = self.backups.clone();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || backups.snapshot(&target)).await?
    }

    /// 撤销写入：有备份则恢复，否则删除新建的文件
    async fn undo_write(&self, target: &Path, backup: Option<&Path>) {
        let backups = self.backups.clone();
        let target_buf = target.to_path_buf();
        let backup_buf = backup.map(Path::to_path_buf);
        let result = tokio::task::spawn_blocking(move || match backup_buf {
            Some(backup) => backups.restore(&backup, &target_buf),
            None => match std::fs::remove_file(&target_buf) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(SyncError::from(e)),
            },
        })
        .await
        .map_err(SyncError::from)
        .and_then(|r| r);
        match result {
            Ok(()) => info!("[SyncCoordinator] 已撤销对 {} 的写入", target.display()),
            Err(e) => error!(
                "[SyncCoordinator] 撤销写入失败，目标文件可能不一致 {}: {}",
                target.display(),
                e
            ),
        }
    }

    async fn finalize_failed(&self, history_id: &str, err: &SyncError) {
        let hid = history_id.to_string();
        let message = err.to_string();
        match self
            .store
            .call(move |conn| HistoryRepository::fail_if_running(conn, &hid, &message))
            .await
        {
            Ok(_) => {}
            Err(db_err) => error!(
                "[SyncCoordinator] 终结历史行 {} 失败: {}",
                history_id, db_err
            ),
        }
    }

    // ------------------------------------------------------------------
    // 事件
    // ------------------------------------------------------------------

    fn emit(&self, event_type: SyncEventType, project_id: &str, data: Value, retry: bool) {
        let mut event = SyncEvent::new(event_type, project_id, data);
        if retry {
            event = event.with_retry();
        }
        self.events.broadcast(event);
    }

    fn emit_success(&self, project_id: &str, outcome: &MergeOutcome) {
        let result = &outcome.result;
        let data = json!({
            "historyId": outcome.history_id,
            "summary": outcome.summary,
            "added": result.added,
            "updated": result.updated,
            "removed": result.removed,
            "unchanged": result.unchanged,
            "backupPath": outcome.backup_path,
        });
        self.emit(SyncEventType::MergeCompleted, project_id, data.clone(), true);
        self.emit(SyncEventType::SyncCompleted, project_id, data, true);
        self.emit(
            SyncEventType::TaskUpdate,
            project_id,
            json!({
                "added": result.added,
                "updated": result.updated,
                "removed": result.removed,
                "addedIds": result.added_ids,
                "updatedIds": result.updated_ids,
                "removedIds": result.removed_ids,
            }),
            false,
        );
        if !result.conflicts.is_empty() {
            let ids: Vec<String> = result
                .conflicts
                .iter()
                .map(|c| c.task_ref().entity_id())
                .collect();
            self.emit(
                SyncEventType::ConflictDetected,
                project_id,
                json!({
                    "count": ids.len(),
                    "entityIds": ids,
                }),
                true,
            );
        }
    }

    fn emit_failure(
        &self,
        event_type: SyncEventType,
        project_id: &str,
        history_id: &str,
        err: &SyncError,
    ) {
        let payload = err.to_payload();
        self.emit(
            event_type,
            project_id,
            json!({
                "historyId": history_id,
                "error": payload,
            }),
            true,
        );
    }

    async fn scan_project(&self, project: &ProjectDescriptor) -> ScanEntry {
        let path = project.tasks_path();
        let read_path = path.clone();
        let read = tokio::task::spawn_blocking(move || read_document(&read_path))
            .await
            .map_err(SyncError::from)
            .and_then(|r| r);
        let (readable, task_count, error) = match read {
            Ok(doc) => (true, doc.collection.total_tasks(), None),
            Err(e) => {
                debug!(
                    "[SyncCoordinator] 项目 {} 任务文件不可读: {}",
                    project.project_id, e
                );
                (false, 0, Some(e.to_string()))
            }
        };
        ScanEntry {
            project_id: project.project_id.clone(),
            name: project.name.clone(),
            tasks_path: path,
            readable,
            task_count,
            error,
        }
    }
}

fn validate_ids(project_id: &str, user_id: &str) -> SyncResult<()> {
    if project_id.trim().is_empty() {
        return Err(SyncError::validation("project_id 不能为空"));
    }
    if user_id.trim().is_empty() {
        return Err(SyncError::validation("user_id 不能为空"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcasterConfig;
    use crate::source::{ConfiguredPathResolver, ProjectEntry, StaticProjectDirectory};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    /// 未配置远程主机的项目不会用到它
    struct UnusedRemote;

    #[async_trait::async_trait]
    impl SourceReader for UnusedRemote {
        fn kind(&self) -> SourceKind {
            SourceKind::Ssh
        }

        async fn read(
            &self,
            _project: &ProjectDescriptor,
            _user_id: &str,
            _cancel: &CancellationToken,
        ) -> SyncResult<TaskCollection> {
            Err(SyncError::read("unexpected remote read"))
        }
    }

    fn coordinator(dir: &TempDir, config: CoordinatorConfig) -> SyncCoordinator {
        let entry = ProjectEntry {
            id: "p1".into(),
            name: "demo".into(),
            root: Some(dir.path().to_path_buf()),
            tag: None,
            members: vec!["u1".into()],
            remote: None,
        };
        let directory = StaticProjectDirectory::new(
            vec![entry],
            Arc::new(ConfiguredPathResolver::default()),
        );
        SyncCoordinator::new(
            config,
            SyncStore::in_memory().unwrap(),
            Arc::new(directory),
            Arc::new(UnusedRemote),
            Arc::new(EventBroadcaster::new(BroadcasterConfig::default())),
        )
    }

    fn tasks_path(dir: &TempDir) -> PathBuf {
        dir.path().join(".taskmaster/tasks/tasks.json")
    }

    fn write_local(dir: &TempDir, doc: Value) {
        let path = tasks_path(dir);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
    }

    fn inline(doc: Value) -> MergeRequest {
        let mut req = MergeRequest::new("p1", "u1");
        req.remote_tasks = Some(doc);
        req
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let dir = TempDir::new().unwrap();
        write_local(&dir, json!({"tasks": [{"id": 1, "title": "A"}]}));
        let before = std::fs::read(tasks_path(&dir)).unwrap();
        let coord = coordinator(&dir, CoordinatorConfig::default());

        let mut req = inline(json!({"tasks": [{"id": 1, "title": "A"}, {"id": 2, "title": "B"}]}));
        req.options.dry_run = true;
        let outcome = coord.merge(req).await.unwrap();

        assert_eq!(outcome.result.added, 1);
        assert!(outcome.history_id.is_none());
        assert!(outcome.backup_path.is_none());
        assert_eq!(std::fs::read(tasks_path(&dir)).unwrap(), before);
        assert!(coord.history("p1", 10).await.unwrap().is_empty());
        let state = coord.sync_state("p1", "u1", SourceKind::Cached).await.unwrap();
        assert_eq!(state.status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_merge_persists_state_history_and_backup() {
        let dir = TempDir::new().unwrap();
        write_local(&dir, json!({"tasks": [{"id": 1, "title": "A"}]}));
        let coord = coordinator(&dir, CoordinatorConfig::default());
        let mut events = coord.events().subscribe("p1");

        let outcome = coord
            .merge(inline(json!({"tasks": [{"id": 1, "title": "A"}, {"id": 2, "title": "B"}]})))
            .await
            .unwrap();
        assert_eq!(outcome.result.added, 1);
        assert_eq!(outcome.result.unchanged, 1);

        let backup = outcome.backup_path.clone().unwrap();
        assert!(backup.exists());
        let written = read_document(&tasks_path(&dir)).unwrap();
        assert_eq!(written.collection.total_tasks(), 2);

        let history = coord.history("p1", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, HistoryStatus::Completed);
        assert_eq!(history[0].counts.added, 1);
        assert_eq!(Some(history[0].id.clone()), outcome.history_id);

        let state = coord.sync_state("p1", "u1", SourceKind::Cached).await.unwrap();
        assert_eq!(state.status, SyncStatus::Completed);
        assert_eq!(state.sync_data.unwrap().total_tasks(), 2);

        let mut types = Vec::new();
        while let Some(event) = events.try_recv() {
            types.push(event.event_type);
        }
        assert_eq!(types.first(), Some(&SyncEventType::SyncStarted));
        assert!(types.contains(&SyncEventType::MergeCompleted));
        assert!(types.contains(&SyncEventType::TaskUpdate));
    }

    #[tokio::test]
    async fn test_unchanged_merge_skips_write_and_backup() {
        let dir = TempDir::new().unwrap();
        write_local(&dir, json!({"tasks": [{"id": 1, "title": "A"}]}));
        let coord = coordinator(&dir, CoordinatorConfig::default());

        let outcome = coord
            .merge(inline(json!({"tasks": [{"id": 1, "title": "A"}]})))
            .await
            .unwrap();
        assert!(!outcome.result.has_changes());
        assert!(outcome.backup_path.is_none());
        assert!(coord.list_backups("p1", "u1").await.unwrap().is_empty());
        let history = coord.history("p1", 10).await.unwrap();
        assert_eq!(history[0].status, HistoryStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_local_file_creates_it() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir, CoordinatorConfig::default());

        let outcome = coord
            .merge(inline(json!({"master": {"tasks": [{"id": 1, "title": "A"}]}})))
            .await
            .unwrap();
        assert_eq!(outcome.result.added, 1);
        assert!(outcome.backup_path.is_none());
        assert!(tasks_path(&dir).exists());
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let dir = TempDir::new().unwrap();
        let coord = coordinator(&dir, CoordinatorConfig::default());

        assert_matches!(
            coord.merge(MergeRequest::new("", "u1")).await,
            Err(SyncError::Validation(_))
        );
        let mut req = MergeRequest::new("p1", "u1");
        req.use_cached_remote = true;
        req.options.prune_missing = true;
        assert_matches!(coord.merge(req).await, Err(SyncError::Validation(_)));

        assert_matches!(
            coord.merge(MergeRequest::new("p1", "intruder")).await,
            Err(SyncError::Unauthorized(_))
        );
        assert_matches!(
            coord.merge(MergeRequest::new("missing", "u1")).await,
            Err(SyncError::NotFound(_))
        );
        assert!(coord.history("p1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_conflicts_are_recorded_and_block() {
        let dir = TempDir::new().unwrap();
        write_local(&dir, json!({"tasks": [{"id": 1, "title": "A"}]}));
        let coord = coordinator(
            &dir,
            CoordinatorConfig {
                conflict_policy: ConflictPolicy::Manual,
                ..Default::default()
            },
        );
        // 建立基线
        coord
            .merge(inline(json!({"tasks": [{"id": 1, "title": "A"}]})))
            .await
            .unwrap();

        write_local(&dir, json!({"tasks": [{"id": 1, "title": "local edit"}]}));
        let outcome = coord
            .merge(inline(json!({"tasks": [{"id": 1, "title": "remote edit"}]})))
            .await
            .unwrap();
        assert_eq!(outcome.result.conflicts.len(), 1);
        assert_eq!(
            outcome.result.conflicts[0].resolution,
            ConflictResolution::Deferred
        );
        let pending = coord.conflicts().list_unresolved("p1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, "master#1");

        let resolved = coord
            .resolve_conflict("p1", "u1", &pending[0].id, ResolutionStrategy::Remote, None)
            .await
            .unwrap();
        assert!(resolved.item.resolved);
        let written = read_document(&tasks_path(&dir)).unwrap();
        assert_eq!(written.collection.tasks("master")[0].title, "remote edit");
        assert!(!coord.conflicts().has_unresolved("p1", "master#1").await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_rejects_foreign_backup() {
        let dir = TempDir::new().unwrap();
        write_local(&dir, json!({"tasks": [{"id": 1, "title": "A"}]}));
        let coord = coordinator(&dir, CoordinatorConfig::default());

        let stray = dir.path().join("elsewhere.json");
        std::fs::write(&stray, b"{}").unwrap();
        assert_matches!(
            coord.rollback("p1", "u1", &stray).await,
            Err(SyncError::Validation(_))
        );
    }

    #[tokio::test]
    async fn test_scan_reports_readability() {
        let dir = TempDir::new().unwrap();
        write_local(&dir, json!({"tasks": [{"id": 1, "title": "A"}, {"id": 2, "title": "B"}]}));
        let coord = coordinator(&dir, CoordinatorConfig::default());

        let report = coord.scan("u1").await.unwrap();
        assert_eq!(report.projects.len(), 1);
        assert!(report.projects[0].readable);
        assert_eq!(report.projects[0].task_count, 2);

        let empty = coord.scan("nobody").await.unwrap();
        assert!(empty.projects.is_empty());
    }
}
