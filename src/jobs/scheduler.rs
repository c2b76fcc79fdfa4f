//! 后台任务调度器
//!
//! 状态机：Queued → Running → {Completed, Failed, Cancelled}，终态不可再转换。
//!
//! 瞬时错误（读取、超时、数据库、IO、并发冲突）按指数退避重试，
//! 其余错误直接进入终态。配置了存储时，提交即为任务建立一条 RUNNING 的
//! SyncHistory 行，所有尝试共用；任务结束时该行若仍为 RUNNING，
//! 由调度器兜底终结，取消和超时也不例外。

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Job, JobQueue, JobSpec, JobStatus, JobTrigger};
use crate::config::duration_secs;
use crate::error::{SyncError, SyncResult};
use crate::store::{
    HistoryCounts, HistoryRepository, HistoryStatus, SyncStore, SyncType, SCAN_SCOPE,
};

/// 调度器参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub sync_concurrency: usize,
    pub scan_concurrency: usize,
    /// 包含首次执行在内的最大尝试次数
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub retry_min_delay: Duration,
    #[serde(with = "duration_secs")]
    pub retry_max_delay: Duration,
    #[serde(with = "duration_secs")]
    pub job_timeout: Duration,
    /// 终态任务保留时长
    #[serde(with = "duration_secs")]
    pub job_retention: Duration,
    #[serde(with = "duration_secs")]
    pub maintenance_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_concurrency: 3,
            scan_concurrency: 1,
            max_attempts: 3,
            retry_min_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            job_timeout: Duration::from_secs(600),
            job_retention: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// 任务执行器
///
/// 实现方需要响应 `cancel`：被取消或超时后尽快返回，必要时先完成回滚。
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job, cancel: &CancellationToken) -> SyncResult<()>;
}

fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "[JobScheduler] Mutex poisoned! Attempting recovery for type: {:?}",
                std::any::type_name::<T>()
            );
            poisoned.into_inner()
        }
    }
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    user: VecDeque<String>,
    scheduled: VecDeque<String>,
    running: usize,
}

impl QueueState {
    fn push(&mut self, id: String, trigger: JobTrigger) {
        match trigger {
            JobTrigger::User => self.user.push_back(id),
            JobTrigger::Scheduled => self.scheduled.push_back(id),
        }
    }

    fn pop_next(&mut self) -> Option<String> {
        self.user.pop_front().or_else(|| self.scheduled.pop_front())
    }
}

/// 任务调度器
pub struct JobScheduler {
    config: SchedulerConfig,
    handler: Arc<dyn JobHandler>,
    store: Option<SyncStore>,
    jobs: DashMap<String, JobEntry>,
    queues: Mutex<HashMap<JobQueue, QueueState>>,
    /// 尚未进入终态的任务数
    active: AtomicUsize,
    idle: Notify,
    accepting: AtomicBool,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        handler: Arc<dyn JobHandler>,
        store: Option<SyncStore>,
    ) -> Self {
        Self {
            config,
            handler,
            store,
            jobs: DashMap::new(),
            queues: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
            accepting: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
        }
    }

    fn limit(&self, queue: JobQueue) -> usize {
        let limit = match queue {
            JobQueue::Sync => self.config.sync_concurrency,
            JobQueue::Scan => self.config.scan_concurrency,
        };
        limit.max(1)
    }

    /// 启动维护 tick：定期清理过期的终态任务
    pub fn start(self: &Arc<Self>) {
        let mut slot = safe_lock(&self.maintenance);
        if slot.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(this.config.maintenance_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let pruned = this.prune_finished_at(Instant::now());
                        if pruned > 0 {
                            debug!("[JobScheduler] 已清理 {} 个过期任务", pruned);
                        }
                    }
                }
            }
        }));
        info!(
            "[JobScheduler] 已启动 (sync={}, scan={})",
            self.limit(JobQueue::Sync),
            self.limit(JobQueue::Scan)
        );
    }

    /// 提交任务，返回任务 ID
    pub fn submit(self: &Arc<Self>, mut spec: JobSpec) -> SyncResult<String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled("调度器已关闭".to_string()));
        }
        if spec.queue == JobQueue::Sync && spec.keys.project_id.is_none() {
            return Err(SyncError::validation("sync 任务必须指定 project_id"));
        }
        if spec.history_id.is_none() {
            spec.history_id = self.open_history(&spec)?;
        }
        let id = Uuid::new_v4().to_string();
        let queue = spec.queue;
        let trigger = spec.trigger;
        let job = Job::from_spec(id.clone(), spec);
        self.active.fetch_add(1, Ordering::SeqCst);
        self.jobs.insert(
            id.clone(),
            JobEntry {
                job,
                cancel: self.shutdown.child_token(),
            },
        );
        safe_lock(&self.queues)
            .entry(queue)
            .or_default()
            .push(id.clone(), trigger);
        debug!(
            "[JobScheduler] 已提交任务 {} (queue={}, trigger={:?})",
            id,
            queue.as_str(),
            trigger
        );
        self.dispatch();
        Ok(id)
    }

    /// 为任务建立 RUNNING 历史行；没有存储时跳过
    fn open_history(&self, spec: &JobSpec) -> SyncResult<Option<String>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let (project_id, sync_type) = match spec.queue {
            JobQueue::Sync => (
                spec.keys.project_id.as_deref().unwrap_or_default(),
                SyncType::Merge,
            ),
            JobQueue::Scan => (SCAN_SCOPE, SyncType::Scan),
        };
        let conn = store.conn()?;
        let history_id =
            HistoryRepository::create_running(&conn, project_id, &spec.keys.user_id, sync_type)?;
        debug!(
            "[JobScheduler] 为 {} 任务建立历史行 {}",
            spec.queue.as_str(),
            history_id
        );
        Ok(Some(history_id))
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|e| e.job.clone())
    }

    /// 全部任务，按创建时间排序
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn running_count(&self, queue: JobQueue) -> usize {
        safe_lock(&self.queues)
            .get(&queue)
            .map(|s| s.running)
            .unwrap_or(0)
    }

    /// 取消任务。排队中的任务直接进入 Cancelled，运行中的任务触发其取消令牌
    pub async fn cancel(&self, id: &str) -> bool {
        let history_id = {
            let Some(mut entry) = self.jobs.get_mut(id) else {
                return false;
            };
            match entry.job.status {
                JobStatus::Queued => {
                    entry.job.status = JobStatus::Cancelled;
                    entry.job.error = Some("任务在排队时被取消".to_string());
                    entry.job.finished_at = Some(Utc::now());
                    entry.job.finished_instant = Some(Instant::now());
                    entry.cancel.cancel();
                    entry.job.history_id.clone()
                }
                JobStatus::Running => {
                    entry.cancel.cancel();
                    info!("[JobScheduler] 已请求取消运行中的任务 {}", id);
                    return true;
                }
                _ => return false,
            }
        };
        info!("[JobScheduler] 已取消排队任务 {}", id);
        if let Some(history_id) = history_id {
            self.resolve_history(&history_id, JobStatus::Cancelled, Some("任务在排队时被取消"))
                .await;
        }
        self.on_terminal();
        true
    }

    /// 清理超过保留期的终态任务，返回清理数量
    pub fn prune_finished_at(&self, now: Instant) -> usize {
        let retention = self.config.job_retention;
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| {
                e.job.status.is_terminal()
                    && e.job
                        .finished_instant
                        .map(|t| now.saturating_duration_since(t) >= retention)
                        .unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            self.jobs.remove(id);
        }
        expired.len()
    }

    /// 等待所有已提交任务进入终态
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// 停止接收新任务，取消排队和运行中的任务并等待其结束
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("[JobScheduler] 正在关闭...");
        let handle = safe_lock(&self.maintenance).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let queued: Vec<String> = self
            .jobs
            .iter()
            .filter(|e| e.job.status == JobStatus::Queued)
            .map(|e| e.key().clone())
            .collect();
        for id in queued {
            self.cancel(&id).await;
        }
        self.shutdown.cancel();
        self.wait_idle().await;
        info!("[JobScheduler] 已关闭");
    }

    fn on_terminal(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    fn dispatch(self: &Arc<Self>) {
        let mut to_start = Vec::new();
        {
            let mut queues = safe_lock(&self.queues);
            for (queue, state) in queues.iter_mut() {
                let limit = self.limit(*queue);
                while state.running < limit {
                    let Some(id) = state.pop_next() else {
                        break;
                    };
                    let runnable = self
                        .jobs
                        .get(&id)
                        .map(|e| e.job.status == JobStatus::Queued)
                        .unwrap_or(false);
                    if !runnable {
                        continue;
                    }
                    state.running += 1;
                    to_start.push((*queue, id));
                }
            }
        }
        for (queue, id) in to_start {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.execute(&id).await;
                if let Some(state) = safe_lock(&this.queues).get_mut(&queue) {
                    state.running = state.running.saturating_sub(1);
                }
                this.dispatch();
            });
        }
    }

    /// 状态转换；非法转换返回 `None`
    fn transition(&self, id: &str, status: JobStatus, error: Option<String>) -> Option<Job> {
        let mut entry = self.jobs.get_mut(id)?;
        if !entry.job.status.can_transition_to(status) {
            warn!(
                "[JobScheduler] 忽略非法状态转换: {} {:?} -> {:?}",
                id, entry.job.status, status
            );
            return None;
        }
        entry.job.status = status;
        entry.job.error = error;
        if status.is_terminal() {
            entry.job.finished_at = Some(Utc::now());
            entry.job.finished_instant = Some(Instant::now());
        }
        Some(entry.job.clone())
    }

    fn begin_attempt(&self, id: &str) -> Option<Job> {
        let mut entry = self.jobs.get_mut(id)?;
        entry.job.attempts += 1;
        Some(entry.job.clone())
    }

    async fn execute(&self, id: &str) {
        let Some(cancel) = self.jobs.get(id).map(|e| e.cancel.clone()) else {
            return;
        };
        let Some(job) = self.transition(id, JobStatus::Running, None) else {
            return;
        };
        info!(
            "[JobScheduler] 开始执行任务 {} (queue={}, provider={})",
            id,
            job.queue.as_str(),
            job.provider
        );

        let timeout = self.config.job_timeout;
        let run = self.run_with_retry(id, &cancel);
        tokio::pin!(run);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;
        let outcome = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    warn!("[JobScheduler] 任务 {} 超过 {:?}，发出取消", id, timeout);
                    cancel.cancel();
                }
            }
        };
        let outcome = match outcome {
            Err(_) if timed_out => Err(SyncError::timeout(
                format!("job {}", id),
                timeout.as_secs(),
            )),
            other => other,
        };

        let (status, message) = match &outcome {
            Ok(()) => (JobStatus::Completed, None),
            Err(SyncError::Cancelled(_)) => (JobStatus::Cancelled, Some(outcome_message(&outcome))),
            Err(_) => (JobStatus::Failed, Some(outcome_message(&outcome))),
        };
        match status {
            JobStatus::Completed => info!("[JobScheduler] 任务 {} 已完成", id),
            _ => warn!(
                "[JobScheduler] 任务 {} 结束于 {:?}: {}",
                id,
                status,
                message.as_deref().unwrap_or_default()
            ),
        }

        if let Some(history_id) = &job.history_id {
            self.resolve_history(history_id, status, message.as_deref())
                .await;
        }
        if self.transition(id, status, message).is_some() {
            self.on_terminal();
        }
    }

    async fn run_with_retry(&self, id: &str, cancel: &CancellationToken) -> SyncResult<()> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.retry_min_delay)
            .with_max_delay(self.config.retry_max_delay)
            .with_max_times(self.config.max_attempts.saturating_sub(1) as usize);
        let handler = &self.handler;

        (|| async move {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled(format!("任务 {} 已取消", id)));
            }
            let job = self
                .begin_attempt(id)
                .ok_or_else(|| SyncError::not_found(format!("任务不存在: {}", id)))?;
            debug!("[JobScheduler] 任务 {} 第 {} 次尝试", id, job.attempts);
            handler.run(&job, cancel).await
        })
        .retry(&backoff)
        .when(|e: &SyncError| e.is_transient())
        .notify(|e: &SyncError, dur: Duration| {
            warn!("[JobScheduler] 任务 {} 失败，{:?} 后重试: {}", id, dur, e);
        })
        .await
    }

    /// 兜底终结关联的历史行
    async fn resolve_history(&self, history_id: &str, status: JobStatus, message: Option<&str>) {
        let Some(store) = &self.store else {
            return;
        };
        let hid = history_id.to_string();
        let result = if status == JobStatus::Completed {
            store
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
                .await
        } else {
            let msg = message.unwrap_or("任务失败").to_string();
            store
                .call(move |conn| HistoryRepository::fail_if_running(conn, &hid, &msg))
                .await
        };
        match result {
            Ok(true) => info!(
                "[JobScheduler] 历史行 {} 由调度器终结为 {:?}",
                history_id, status
            ),
            Ok(false) => {}
            Err(e) => error!("[JobScheduler] 终结历史行 {} 失败: {}", history_id, e),
        }
    }
}

fn outcome_message(outcome: &SyncResult<()>) -> String {
    match outcome {
        Ok(()) => String::new(),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{BoxFuture, FutureExt};
    use std::future::Future;
    use std::sync::atomic::AtomicU32;

    type RunFn = dyn Fn(Job, CancellationToken) -> BoxFuture<'static, SyncResult<()>> + Send + Sync;

    struct FnHandler(Box<RunFn>);

    #[async_trait]
    impl JobHandler for FnHandler {
        async fn run(&self, job: &Job, cancel: &CancellationToken) -> SyncResult<()> {
            (self.0)(job.clone(), cancel.clone()).await
        }
    }

    fn handler<F, Fut>(f: F) -> Arc<dyn JobHandler>
    where
        F: Fn(Job, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        Arc::new(FnHandler(Box::new(move |job, cancel| f(job, cancel).boxed())))
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            retry_min_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_concurrency_ceilings() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak_sync = Arc::new(AtomicUsize::new(0));
        let peak_scan = Arc::new(AtomicUsize::new(0));
        let (c, ps, pc) = (current.clone(), peak_sync.clone(), peak_scan.clone());
        let scan_current = Arc::new(AtomicUsize::new(0));
        let sc = scan_current.clone();

        let h = handler(move |job, _| {
            let (counter, peak) = match job.queue {
                JobQueue::Sync => (c.clone(), ps.clone()),
                JobQueue::Scan => (sc.clone(), pc.clone()),
            };
            Box::pin(async move {
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let scheduler = Arc::new(JobScheduler::new(fast_config(), h, None));
        for i in 0..7 {
            scheduler
                .submit(JobSpec::sync(format!("p{}", i), "u1", JobTrigger::Scheduled))
                .unwrap();
        }
        for _ in 0..3 {
            scheduler
                .submit(JobSpec::scan("u1", JobTrigger::Scheduled))
                .unwrap();
        }
        scheduler.wait_idle().await;

        assert_eq!(peak_sync.load(Ordering::SeqCst), 3);
        assert_eq!(peak_scan.load(Ordering::SeqCst), 1);
        assert!(scheduler
            .list()
            .iter()
            .all(|j| j.status == JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_user_jobs_run_before_scheduled() {
        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let (g, o) = (gate.clone(), order.clone());
        let h = handler(move |job, _| {
            let g = g.clone();
            let o = o.clone();
            Box::pin(async move {
                let project = job.keys.project_id.clone().unwrap_or_default();
                if project == "gate" {
                    g.notified().await;
                }
                o.lock().unwrap().push(project);
                Ok(())
            })
        });
        let scheduler = Arc::new(JobScheduler::new(
            SchedulerConfig {
                sync_concurrency: 1,
                ..fast_config()
            },
            h,
            None,
        ));

        scheduler
            .submit(JobSpec::sync("gate", "u1", JobTrigger::User))
            .unwrap();
        for (p, t) in [
            ("s1", JobTrigger::Scheduled),
            ("s2", JobTrigger::Scheduled),
            ("u1", JobTrigger::User),
            ("u2", JobTrigger::User),
        ] {
            scheduler.submit(JobSpec::sync(p, "u1", t)).unwrap();
        }
        gate.notify_one();
        scheduler.wait_idle().await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["gate", "u1", "u2", "s1", "s2"]
        );
    }

    #[tokio::test]
    async fn test_transient_failure_exhausts_and_finalizes_history() {
        let store = SyncStore::in_memory().unwrap();
        let history_id = store
            .call(|conn| HistoryRepository::create_running(conn, "p1", "u1", SyncType::Merge))
            .await
            .unwrap();

        let h = handler(|_, _| Box::pin(async { Err(SyncError::read("connection reset")) }));
        let scheduler = Arc::new(JobScheduler::new(fast_config(), h, Some(store.clone())));
        let id = scheduler
            .submit(JobSpec::sync("p1", "u1", JobTrigger::User).with_history(history_id.clone()))
            .unwrap();
        scheduler.wait_idle().await;

        let job = scheduler.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.error.unwrap().contains("connection reset"));

        let row = store
            .call(move |conn| HistoryRepository::get(conn, &history_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, HistoryStatus::Failed);
        assert!(row.error_message.unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_submit_opens_one_history_row_per_job() {
        let store = SyncStore::in_memory().unwrap();
        let h = handler(|_, _| Box::pin(async { Err(SyncError::read("connection reset")) }));
        let scheduler = Arc::new(JobScheduler::new(fast_config(), h, Some(store.clone())));
        let sync_id = scheduler
            .submit(JobSpec::sync("p1", "u1", JobTrigger::User))
            .unwrap();
        let scan_id = scheduler
            .submit(JobSpec::scan("u1", JobTrigger::Scheduled))
            .unwrap();
        let sync_history = scheduler.get(&sync_id).unwrap().history_id.unwrap();
        let scan_history = scheduler.get(&scan_id).unwrap().history_id.unwrap();
        scheduler.wait_idle().await;
        assert_eq!(scheduler.get(&sync_id).unwrap().attempts, 3);

        // 三次尝试共用一条历史行
        let rows = store
            .call(|conn| HistoryRepository::list_for_project(conn, "p1", 10))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, sync_history);
        assert_eq!(rows[0].sync_type, SyncType::Merge);
        assert_eq!(rows[0].status, HistoryStatus::Failed);

        let scan_rows = store
            .call(|conn| HistoryRepository::list_for_project(conn, SCAN_SCOPE, 10))
            .await
            .unwrap();
        assert_eq!(scan_rows.len(), 1);
        assert_eq!(scan_rows[0].id, scan_history);
        assert_eq!(scan_rows[0].sync_type, SyncType::Scan);
        assert_eq!(scan_rows[0].status, HistoryStatus::Failed);
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_terminal_immediately() {
        let h = handler(|_, _| Box::pin(async { Err(SyncError::Auth("bad key".into())) }));
        let scheduler = Arc::new(JobScheduler::new(fast_config(), h, None));
        let id = scheduler
            .submit(JobSpec::sync("p1", "u1", JobTrigger::User))
            .unwrap();
        scheduler.wait_idle().await;

        let job = scheduler.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let h = handler(move |_, _| {
            let c = c.clone();
            Box::pin(async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::timeout("ssh read", 30))
                } else {
                    Ok(())
                }
            })
        });
        let scheduler = Arc::new(JobScheduler::new(fast_config(), h, None));
        let id = scheduler
            .submit(JobSpec::sync("p1", "u1", JobTrigger::User))
            .unwrap();
        scheduler.wait_idle().await;

        let job = scheduler.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let store = SyncStore::in_memory().unwrap();
        let history_id = store
            .call(|conn| HistoryRepository::create_running(conn, "p1", "u1", SyncType::Merge))
            .await
            .unwrap();
        let started = Arc::new(Notify::new());
        let s = started.clone();
        let h = handler(move |_, cancel| {
            let s = s.clone();
            Box::pin(async move {
                s.notify_one();
                cancel.cancelled().await;
                Err(SyncError::Cancelled("stopped".into()))
            })
        });
        let scheduler = Arc::new(JobScheduler::new(fast_config(), h, Some(store.clone())));
        let id = scheduler
            .submit(JobSpec::sync("p1", "u1", JobTrigger::User).with_history(history_id.clone()))
            .unwrap();
        started.notified().await;
        assert!(scheduler.cancel(&id).await);
        scheduler.wait_idle().await;

        assert_eq!(scheduler.get(&id).unwrap().status, JobStatus::Cancelled);
        assert!(!scheduler.cancel(&id).await);
        let row = store
            .call(move |conn| HistoryRepository::get(conn, &history_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, HistoryStatus::Failed);
    }

    #[tokio::test]
    async fn test_job_timeout_fails_job() {
        let h = handler(|_, cancel| {
            Box::pin(async move {
                cancel.cancelled().await;
                Err(SyncError::Cancelled("interrupted".into()))
            })
        });
        let scheduler = Arc::new(JobScheduler::new(
            SchedulerConfig {
                job_timeout: Duration::from_millis(20),
                ..fast_config()
            },
            h,
            None,
        ));
        let id = scheduler
            .submit(JobSpec::sync("p1", "u1", JobTrigger::User))
            .unwrap();
        scheduler.wait_idle().await;

        let job = scheduler.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_prune_finished_jobs() {
        let h = handler(|_, _| Box::pin(async { Ok(()) }));
        let scheduler = Arc::new(JobScheduler::new(fast_config(), h, None));
        scheduler
            .submit(JobSpec::scan("u1", JobTrigger::User))
            .unwrap();
        scheduler.wait_idle().await;

        assert_eq!(scheduler.prune_finished_at(Instant::now()), 0);
        let later = Instant::now() + Duration::from_secs(3601);
        assert_eq!(scheduler.prune_finished_at(later), 1);
        assert!(scheduler.list().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_jobs() {
        let h = handler(|_, cancel| {
            Box::pin(async move {
                cancel.cancelled().await;
                Err(SyncError::Cancelled("shutdown".into()))
            })
        });
        let scheduler = Arc::new(JobScheduler::new(
            SchedulerConfig {
                scan_concurrency: 1,
                ..fast_config()
            },
            h,
            None,
        ));
        let first = scheduler
            .submit(JobSpec::scan("u1", JobTrigger::User))
            .unwrap();
        let second = scheduler
            .submit(JobSpec::scan("u2", JobTrigger::User))
            .unwrap();
        scheduler.shutdown().await;

        assert_eq!(scheduler.get(&second).unwrap().status, JobStatus::Cancelled);
        assert!(scheduler.get(&first).unwrap().status.is_terminal());
        assert!(scheduler
            .submit(JobSpec::scan("u3", JobTrigger::User))
            .is_err());
    }
}
