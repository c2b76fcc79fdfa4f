//! SyncState 持久化
//!
//! 每个 (project, user, source_kind) 一行。`sync_data` 保存上一次合并结果，
//! 既是下次合并判断本地变化的基线，也是 CACHED 读取器返回的快照；
//! `remote_baseline` 保存上一次读到的远端集合，用于判断远端变化。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::models::TaskCollection;
use crate::source::SourceKind;

/// 同步状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "IDLE",
            SyncStatus::Running => "RUNNING",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(SyncStatus::Idle),
            "RUNNING" => Some(SyncStatus::Running),
            "COMPLETED" => Some(SyncStatus::Completed),
            "FAILED" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// 状态行主键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncStateKey {
    pub project_id: String,
    pub user_id: String,
    pub source_kind: SourceKind,
}

impl SyncStateKey {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>, source_kind: SourceKind) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            source_kind,
        }
    }
}

/// 同步状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateRecord {
    pub status: SyncStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub sync_data: Option<TaskCollection>,
    #[serde(default)]
    pub remote_baseline: Option<TaskCollection>,
}

/// 状态仓库
pub struct StateRepository;

impl StateRepository {
    const UPSERT_SQL: &'static str = r#"
        INSERT INTO sync_state (
            project_id, user_id, source_kind, status, last_sync_at,
            error_message, sync_data, remote_baseline, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(project_id, user_id, source_kind) DO UPDATE SET
            status = excluded.status,
            last_sync_at = excluded.last_sync_at,
            error_message = excluded.error_message,
            sync_data = excluded.sync_data,
            remote_baseline = excluded.remote_baseline,
            updated_at = excluded.updated_at
    "#;

    /// 读取状态；不存在时返回 IDLE 默认值
    pub fn load(conn: &Connection, key: &SyncStateKey) -> SyncResult<SyncStateRecord> {
        let row = conn
            .query_row(
                "SELECT status, last_sync_at, error_message, sync_data, remote_baseline
                 FROM sync_state WHERE project_id = ?1 AND user_id = ?2 AND source_kind = ?3",
                params![key.project_id, key.user_id, key.source_kind.as_str()],
                Self::row_to_record,
            )
            .optional()?;
        match row {
            Some(record) => record,
            None => Ok(SyncStateRecord::default()),
        }
    }

    /// 写入完整状态
    pub fn save(conn: &Connection, key: &SyncStateKey, record: &SyncStateRecord) -> SyncResult<()> {
        let sync_data = record
            .sync_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let remote_baseline = record
            .remote_baseline
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            Self::UPSERT_SQL,
            params![
                key.project_id,
                key.user_id,
                key.source_kind.as_str(),
                record.status.as_str(),
                record.last_sync_at.map(|t| t.to_rfc3339()),
                record.error_message,
                sync_data,
                remote_baseline,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// 只改状态与错误信息，保留上一次的基线快照
    pub fn set_status(
        conn: &Connection,
        key: &SyncStateKey,
        status: SyncStatus,
        error_message: Option<&str>,
    ) -> SyncResult<()> {
        let mut record = Self::load(conn, key)?;
        record.status = status;
        record.error_message = error_message.map(str::to_string);
        Self::save(conn, key, &record)
    }

    /// 回滚后把 (project, user) 的全部状态行重置为 IDLE，基线快照保留
    pub fn reset_to_idle(conn: &Connection, project_id: &str, user_id: &str) -> SyncResult<usize> {
        let changed = conn.execute(
            "UPDATE sync_state SET status = 'IDLE', error_message = NULL, updated_at = ?3
             WHERE project_id = ?1 AND user_id = ?2",
            params![project_id, user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(changed)
    }

    /// 该 (project, user) 最近一次持久化的快照，不区分来源
    pub fn latest_snapshot(
        conn: &Connection,
        project_id: &str,
        user_id: &str,
    ) -> SyncResult<Option<TaskCollection>> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT sync_data FROM sync_state
                 WHERE project_id = ?1 AND user_id = ?2 AND sync_data IS NOT NULL
                 ORDER BY updated_at DESC LIMIT 1",
                params![project_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).map_err(SyncError::from))
            .transpose()
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<SyncResult<SyncStateRecord>> {
        let status: String = row.get(0)?;
        let last_sync_at: Option<String> = row.get(1)?;
        let error_message: Option<String> = row.get(2)?;
        let sync_data: Option<String> = row.get(3)?;
        let remote_baseline: Option<String> = row.get(4)?;
        Ok((|| -> SyncResult<SyncStateRecord> {
            let status = SyncStatus::from_str(&status)
                .ok_or_else(|| SyncError::database(format!("未知同步状态: {}", status)))?;
            let last_sync_at = last_sync_at
                .map(|s| {
                    DateTime::parse_from_rfc3339(&s)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| SyncError::database(format!("时间戳解析失败: {}", e)))
                })
                .transpose()?;
            let sync_data = sync_data
                .map(|s| serde_json::from_str::<TaskCollection>(&s))
                .transpose()?;
            let remote_baseline = remote_baseline
                .map(|s| serde_json::from_str::<TaskCollection>(&s))
                .transpose()?;
            Ok(SyncStateRecord {
                status,
                last_sync_at,
                error_message,
                sync_data,
                remote_baseline,
            })
        })())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskRecord;
    use crate::store::SyncStore;

    #[test]
    fn test_missing_state_defaults_to_idle() {
        let store = SyncStore::in_memory().unwrap();
        let conn = store.conn().unwrap();
        let key = SyncStateKey::new("p1", "u1", SourceKind::Ssh);
        let state = StateRepository::load(&conn, &key).unwrap();
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(state.sync_data.is_none());
    }

    #[test]
    fn test_set_status_keeps_snapshot() {
        let store = SyncStore::in_memory().unwrap();
        let conn = store.conn().unwrap();
        let key = SyncStateKey::new("p1", "u1", SourceKind::Ssh);
        let snapshot = TaskCollection::from_tasks("master", vec![TaskRecord::new(1u64, "master", "A")]);
        let remote = TaskCollection::from_tasks("master", vec![TaskRecord::new(1u64, "master", "R")]);
        StateRepository::save(
            &conn,
            &key,
            &SyncStateRecord {
                status: SyncStatus::Completed,
                last_sync_at: Some(Utc::now()),
                error_message: None,
                sync_data: Some(snapshot.clone()),
                remote_baseline: Some(remote.clone()),
            },
        )
        .unwrap();

        StateRepository::set_status(&conn, &key, SyncStatus::Failed, Some("boom")).unwrap();
        let state = StateRepository::load(&conn, &key).unwrap();
        assert_eq!(state.status, SyncStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("boom"));
        assert_eq!(state.sync_data, Some(snapshot.clone()));
        assert_eq!(state.remote_baseline, Some(remote));

        let latest = StateRepository::latest_snapshot(&conn, "p1", "u1").unwrap();
        assert_eq!(latest, Some(snapshot));
        assert!(StateRepository::latest_snapshot(&conn, "p1", "other").unwrap().is_none());
    }

    #[test]
    fn test_reset_to_idle() {
        let store = SyncStore::in_memory().unwrap();
        let conn = store.conn().unwrap();
        for kind in [SourceKind::Ssh, SourceKind::Cached] {
            let key = SyncStateKey::new("p1", "u1", kind);
            StateRepository::set_status(&conn, &key, SyncStatus::Failed, Some("boom")).unwrap();
        }
        assert_eq!(StateRepository::reset_to_idle(&conn, "p1", "u1").unwrap(), 2);
        let state =
            StateRepository::load(&conn, &SyncStateKey::new("p1", "u1", SourceKind::Ssh)).unwrap();
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(state.error_message.is_none());
        assert_eq!(StateRepository::reset_to_idle(&conn, "p2", "u1").unwrap(), 0);
    }
}
