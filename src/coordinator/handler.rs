//! 把调度器的任务交给协调器执行

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{MergeRequest, SyncCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::jobs::{Job, JobHandler, JobQueue};

/// 使用缓存快照作为远端的 provider 名
pub const CACHED_PROVIDER: &str = "cached";

pub struct CoordinatorJobHandler {
    coordinator: Arc<SyncCoordinator>,
}

impl CoordinatorJobHandler {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl JobHandler for CoordinatorJobHandler {
    async fn run(&self, job: &Job, cancel: &CancellationToken) -> SyncResult<()> {
        debug!(
            "[CoordinatorJobHandler] 执行任务 {} (queue={}, provider={}, attempt={})",
            job.id,
            job.queue.as_str(),
            job.provider,
            job.attempts
        );
        match job.queue {
            JobQueue::Sync => {
                let project_id = job
                    .keys
                    .project_id
                    .clone()
                    .ok_or_else(|| SyncError::validation("同步任务缺少 project_id"))?;
                let mut request = MergeRequest::new(project_id, job.keys.user_id.clone());
                request.use_cached_remote = job.provider == CACHED_PROVIDER;
                self.coordinator
                    .merge_with(request, job.history_id.clone(), cancel)
                    .await
                    .map(|_| ())
            }
            JobQueue::Scan => self
                .coordinator
                .scan_with(&job.keys.user_id, job.history_id.clone(), cancel)
                .await
                .map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::events::{BroadcasterConfig, EventBroadcaster};
    use crate::jobs::{JobScheduler, JobSpec, JobStatus, JobTrigger, SchedulerConfig};
    use crate::models::TaskCollection;
    use crate::source::{
        ConfiguredPathResolver, ProjectDescriptor, ProjectEntry, SourceKind, SourceReader,
        StaticProjectDirectory,
    };
    use crate::store::{HistoryRepository, HistoryStatus, SyncStore, SyncType};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct UnusedRemote;

    #[async_trait]
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

    fn setup(dir: &TempDir) -> (SyncStore, Arc<JobScheduler>) {
        let path = dir.path().join(".taskmaster/tasks/tasks.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({"tasks": [{"id": 1, "title": "A"}]})).unwrap(),
        )
        .unwrap();

        let store = SyncStore::in_memory().unwrap();
        let directory = StaticProjectDirectory::new(
            vec![ProjectEntry {
                id: "p1".into(),
                name: "demo".into(),
                root: Some(dir.path().to_path_buf()),
                tag: None,
                members: vec![],
                remote: None,
            }],
            Arc::new(ConfiguredPathResolver::default()),
        );
        let coordinator = Arc::new(SyncCoordinator::new(
            CoordinatorConfig::default(),
            store.clone(),
            Arc::new(directory),
            Arc::new(UnusedRemote),
            Arc::new(EventBroadcaster::new(BroadcasterConfig::default())),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            SchedulerConfig {
                retry_min_delay: Duration::from_millis(5),
                retry_max_delay: Duration::from_millis(20),
                ..Default::default()
            },
            Arc::new(CoordinatorJobHandler::new(coordinator)),
            Some(store.clone()),
        ));
        scheduler.start();
        (store, scheduler)
    }

    #[tokio::test]
    async fn test_sync_job_finalizes_its_history_row() {
        let dir = TempDir::new().unwrap();
        let (store, scheduler) = setup(&dir);
        let history_id = store
            .call(|conn| HistoryRepository::create_running(conn, "p1", "u1", SyncType::Merge))
            .await
            .unwrap();

        let spec = JobSpec::sync("p1", "u1", JobTrigger::User)
            .with_provider(CACHED_PROVIDER)
            .with_history(history_id.clone());
        let job_id = scheduler.submit(spec).unwrap();
        scheduler.wait_idle().await;

        assert_eq!(scheduler.get(&job_id).unwrap().status, JobStatus::Completed);
        let rows = store
            .call(|conn| HistoryRepository::list_for_project(conn, "p1", 10))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, history_id);
        assert_eq!(rows[0].status, HistoryStatus::Completed);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_job_without_history_gets_one_row() {
        let dir = TempDir::new().unwrap();
        let (store, scheduler) = setup(&dir);

        let spec = JobSpec::sync("p1", "u1", JobTrigger::User).with_provider(CACHED_PROVIDER);
        let job_id = scheduler.submit(spec).unwrap();
        scheduler.wait_idle().await;

        let job = scheduler.get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let rows = store
            .call(|conn| HistoryRepository::list_for_project(conn, "p1", 10))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(Some(rows[0].id.clone()), job.history_id);
        assert_eq!(rows[0].status, HistoryStatus::Completed);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_scan_job_completes() {
        let dir = TempDir::new().unwrap();
        let (_store, scheduler) = setup(&dir);
        let job_id = scheduler
            .submit(JobSpec::scan("u1", JobTrigger::Scheduled))
            .unwrap();
        scheduler.wait_idle().await;
        assert_eq!(scheduler.get(&job_id).unwrap().status, JobStatus::Completed);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_project_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let (_store, scheduler) = setup(&dir);
        let job_id = scheduler
            .submit(JobSpec::sync("missing", "u1", JobTrigger::User))
            .unwrap();
        scheduler.wait_idle().await;
        let job = scheduler.get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        scheduler.shutdown().await;
    }
}
