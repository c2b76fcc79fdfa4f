//! SyncHistory 审计行
//!
//! 行在任何 I/O 之前以 RUNNING 创建，之后恰好终结一次。
//! `finalize` 的 UPDATE 只匹配仍处于 RUNNING 的行，重复终结是无操作。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::models::TaskCollection;

/// 扫描历史行使用的项目占位
pub const SCAN_SCOPE: &str = "*";

/// 同步类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    Merge,
    Rollback,
    Scan,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Merge => "MERGE",
            SyncType::Rollback => "ROLLBACK",
            SyncType::Scan => "SCAN",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MERGE" => Some(SyncType::Merge),
            "ROLLBACK" => Some(SyncType::Rollback),
            "SCAN" => Some(SyncType::Scan),
            _ => None,
        }
    }
}

/// 历史行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryStatus {
    Running,
    Completed,
    Failed,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Running => "RUNNING",
            HistoryStatus::Completed => "COMPLETED",
            HistoryStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(HistoryStatus::Running),
            "COMPLETED" => Some(HistoryStatus::Completed),
            "FAILED" => Some(HistoryStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCounts {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// 一条历史记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHistoryRow {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub sync_type: SyncType,
    pub status: HistoryStatus,
    pub counts: HistoryCounts,
    pub sync_data: Option<TaskCollection>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 历史仓库
pub struct HistoryRepository;

impl HistoryRepository {
    const INSERT_SQL: &'static str = r#"
        INSERT INTO sync_history (id, project_id, user_id, sync_type, status, started_at)
        VALUES (?1, ?2, ?3, ?4, 'RUNNING', ?5)
    "#;

    const FINALIZE_SQL: &'static str = r#"
        UPDATE sync_history
        SET status = ?2, tasks_added = ?3, tasks_updated = ?4, tasks_removed = ?5,
            sync_data = ?6, error_message = ?7, completed_at = ?8
        WHERE id = ?1 AND status = 'RUNNING'
    "#;

    const SELECT_COLUMNS: &'static str = "id, project_id, user_id, sync_type, status, \
        tasks_added, tasks_updated, tasks_removed, sync_data, error_message, started_at, completed_at";

    /// 创建 RUNNING 行，返回其 ID
    pub fn create_running(
        conn: &Connection,
        project_id: &str,
        user_id: &str,
        sync_type: SyncType,
    ) -> SyncResult<String> {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            Self::INSERT_SQL,
            params![id, project_id, user_id, sync_type.as_str(), Utc::now().to_rfc3339()],
        )?;
        debug!(
            "[SyncHistory] 创建历史行: id={}, project={}, type={}",
            id,
            project_id,
            sync_type.as_str()
        );
        Ok(id)
    }

    /// 终结历史行；行已处于终态时返回 `false`
    pub fn finalize(
        conn: &Connection,
        id: &str,
        status: HistoryStatus,
        counts: HistoryCounts,
        sync_data: Option<&TaskCollection>,
        error_message: Option<&str>,
    ) -> SyncResult<bool> {
        if status == HistoryStatus::Running {
            return Err(SyncError::validation("历史行不能终结为 RUNNING"));
        }
        let sync_data = sync_data.map(serde_json::to_string).transpose()?;
        let changed = conn.execute(
            Self::FINALIZE_SQL,
            params![
                id,
                status.as_str(),
                counts.added as i64,
                counts.updated as i64,
                counts.removed as i64,
                sync_data,
                error_message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            warn!("[SyncHistory] 历史行 {} 已终结或不存在，忽略重复终结", id);
        }
        Ok(changed > 0)
    }

    /// 若仍为 RUNNING 则标记为 FAILED；调度器兜底用
    pub fn fail_if_running(conn: &Connection, id: &str, error_message: &str) -> SyncResult<bool> {
        Self::finalize(
            conn,
            id,
            HistoryStatus::Failed,
            HistoryCounts::default(),
            None,
            Some(error_message),
        )
    }

    pub fn get(conn: &Connection, id: &str) -> SyncResult<Option<SyncHistoryRow>> {
        let sql = format!("SELECT {} FROM sync_history WHERE id = ?1", Self::SELECT_COLUMNS);
        let row = conn
            .query_row(&sql, params![id], Self::row_to_history)
            .optional()?;
        row.transpose()
    }

    /// 项目最近的历史，按开始时间倒序
    pub fn list_for_project(
        conn: &Connection,
        project_id: &str,
        limit: usize,
    ) -> SyncResult<Vec<SyncHistoryRow>> {
        let sql = format!(
            "SELECT {} FROM sync_history WHERE project_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
            Self::SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id, limit as i64], Self::row_to_history)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    fn row_to_history(row: &Row) -> rusqlite::Result<SyncResult<SyncHistoryRow>> {
        let id: String = row.get(0)?;
        let project_id: String = row.get(1)?;
        let user_id: String = row.get(2)?;
        let sync_type: String = row.get(3)?;
        let status: String = row.get(4)?;
        let added: i64 = row.get(5)?;
        let updated: i64 = row.get(6)?;
        let removed: i64 = row.get(7)?;
        let sync_data: Option<String> = row.get(8)?;
        let error_message: Option<String> = row.get(9)?;
        let started_at: String = row.get(10)?;
        let completed_at: Option<String> = row.get(11)?;

        Ok((|| -> SyncResult<SyncHistoryRow> {
            let sync_type = SyncType::from_str(&sync_type)
                .ok_or_else(|| SyncError::database(format!("未知同步类型: {}", sync_type)))?;
            let status = HistoryStatus::from_str(&status)
                .ok_or_else(|| SyncError::database(format!("未知历史状态: {}", status)))?;
            Ok(SyncHistoryRow {
                id,
                project_id,
                user_id,
                sync_type,
                status,
                counts: HistoryCounts {
                    added: added.max(0) as usize,
                    updated: updated.max(0) as usize,
                    removed: removed.max(0) as usize,
                },
                sync_data: sync_data
                    .map(|s| serde_json::from_str::<TaskCollection>(&s))
                    .transpose()?,
                error_message,
                started_at: parse_time(&started_at)?,
                completed_at: completed_at.as_deref().map(parse_time).transpose()?,
            })
        })())
    }
}

fn parse_time(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::database(format!("时间戳解析失败: {}", e)))
}
