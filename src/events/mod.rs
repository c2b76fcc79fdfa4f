//! # Events 模块
//!
//! 同步结果的推送。事件按项目投递给订阅者，发布方永远不会被阻塞。
//!
//! 线上格式：
//!
//! ```json
//! { "type": "merge-completed", "projectId": "p1", "data": { ... }, "timestamp": "..." }
//! ```

pub mod broadcaster;

pub use broadcaster::{BroadcasterConfig, EventBroadcaster, Subscription};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncEventType {
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    MergeCompleted,
    MergeFailed,
    MergeRollback,
    TaskUpdate,
    ConflictDetected,
    ScanCompleted,
    Heartbeat,
}

impl SyncEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventType::SyncStarted => "sync-started",
            SyncEventType::SyncCompleted => "sync-completed",
            SyncEventType::SyncFailed => "sync-failed",
            SyncEventType::MergeCompleted => "merge-completed",
            SyncEventType::MergeFailed => "merge-failed",
            SyncEventType::MergeRollback => "merge-rollback",
            SyncEventType::TaskUpdate => "task-update",
            SyncEventType::ConflictDetected => "conflict-detected",
            SyncEventType::ScanCompleted => "scan-completed",
            SyncEventType::Heartbeat => "heartbeat",
        }
    }
}

/// 推送给订阅者的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub event_type: SyncEventType,
    pub project_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// 通道已满时是否进入重试队列；不参与序列化
    #[serde(skip)]
    pub retry: bool,
}

impl SyncEvent {
    pub fn new(event_type: SyncEventType, project_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            project_id: project_id.into(),
            data,
            timestamp: Utc::now(),
            retry: false,
        }
    }

    /// 标记为需要重试投递
    pub fn with_retry(mut self) -> Self {
        self.retry = true;
        self
    }

    pub fn heartbeat(project_id: impl Into<String>) -> Self {
        Self::new(SyncEventType::Heartbeat, project_id, Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let event = SyncEvent::new(
            SyncEventType::MergeCompleted,
            "p1",
            json!({"added": 2}),
        )
        .with_retry();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "merge-completed");
        assert_eq!(value["projectId"], "p1");
        assert_eq!(value["data"]["added"], 2);
        assert!(value.get("retry").is_none());
        assert!(value["timestamp"].is_string());
        assert_eq!(
            serde_json::to_value(SyncEventType::ConflictDetected).unwrap(),
            json!(SyncEventType::ConflictDetected.as_str())
        );
    }
}
