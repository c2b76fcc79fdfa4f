// Task Sync library entry
// 任务集合的同步与合并引擎：读取本地/远程 tasks.json，三方合并，
// 备份后原子写回，并记录状态、历史与冲突。

pub mod backup;
pub mod config;
pub mod conflicts;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod merge;
pub mod models;
pub mod source;
pub mod store;

pub use config::SyncConfig;
pub use coordinator::{
    CoordinatorConfig, CoordinatorJobHandler, MergeOptions, MergeOutcome, MergeRequest,
    RollbackOutcome, ScanReport, SyncCoordinator, SyncReport, SyncRequest,
};
pub use error::{ErrorClass, ErrorPayload, SyncError, SyncResult};
pub use events::{EventBroadcaster, SyncEvent, SyncEventType};
pub use jobs::{JobHandler, JobScheduler, JobSpec, JobTrigger};
pub use merge::{merge, ConflictPolicy, MergeBaseline, MergePolicy, MergeResult};
pub use models::{TaskCollection, TaskId, TaskRecord, TaskStatus};
pub use source::{ProjectDescriptor, ProjectDirectory, SourceKind, SourceReader, TaskSink};
pub use store::SyncStore;
