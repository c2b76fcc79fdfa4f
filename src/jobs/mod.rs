//! # Jobs 模块
//!
//! 后台同步/扫描任务的调度。
//!
//! - `sync` 队列：按仓库执行同步，默认最多 3 个并行
//! - `scan` 队列：按用户发现项目，串行执行
//!
//! 同一优先级内 FIFO，用户触发的任务先于定时任务出队。

pub mod scheduler;

pub use scheduler::{JobHandler, JobScheduler, SchedulerConfig};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// 任务队列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobQueue {
    Sync,
    Scan,
}

impl JobQueue {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobQueue::Sync => "sync",
            JobQueue::Scan => "scan",
        }
    }
}

/// 任务触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    User,
    Scheduled,
}

/// 任务状态机：排队、运行、完成、失败、已取消
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        if *self == target {
            return !self.is_terminal();
        }
        match self {
            JobStatus::Queued => matches!(
                target,
                JobStatus::Running | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Running => matches!(
                target,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

/// 任务键：sync 队列按项目，scan 队列按用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobKeys {
    pub project_id: Option<String>,
    pub user_id: String,
}

/// 提交任务的参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub queue: JobQueue,
    pub keys: JobKeys,
    /// 远程数据来源，如 `ssh` / `cached`
    pub provider: String,
    /// 该任务负责终结的 SyncHistory 行
    pub history_id: Option<String>,
    pub trigger: JobTrigger,
}

impl JobSpec {
    pub fn sync(project_id: impl Into<String>, user_id: impl Into<String>, trigger: JobTrigger) -> Self {
        Self {
            queue: JobQueue::Sync,
            keys: JobKeys {
                project_id: Some(project_id.into()),
                user_id: user_id.into(),
            },
            provider: "ssh".to_string(),
            history_id: None,
            trigger,
        }
    }

    pub fn scan(user_id: impl Into<String>, trigger: JobTrigger) -> Self {
        Self {
            queue: JobQueue::Scan,
            keys: JobKeys {
                project_id: None,
                user_id: user_id.into(),
            },
            provider: "directory".to_string(),
            history_id: None,
            trigger,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_history(mut self, history_id: impl Into<String>) -> Self {
        self.history_id = Some(history_id.into());
        self
    }
}

/// 任务快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue: JobQueue,
    pub keys: JobKeys,
    pub provider: String,
    pub history_id: Option<String>,
    pub trigger: JobTrigger,
    pub attempts: u32,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) finished_instant: Option<Instant>,
}

impl Job {
    pub(crate) fn from_spec(id: String, spec: JobSpec) -> Self {
        Self {
            id,
            queue: spec.queue,
            keys: spec.keys,
            provider: spec.provider,
            history_id: spec.history_id,
            trigger: spec.trigger,
            attempts: 0,
            status: JobStatus::Queued,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
            finished_instant: None,
        }
    }
}
