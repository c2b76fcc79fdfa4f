//! 离线冲突存储
//!
//! 离线客户端的本地修改与新拉取的远端修改针对同一实体发生分歧时记录在此，
//! 等待人工选择 local / remote / merged。冲突按项目隔离；项目内存在未解决
//! 冲突的实体会作为 `blocked` 传给该项目的合并器，不会被自动覆盖。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::merge::TaskRef;
use crate::models::{TaskCollection, TaskRecord};
use crate::store::SyncStore;

/// 冲突解决方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    Local,
    Remote,
    Merged,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Local => "local",
            ResolutionStrategy::Remote => "remote",
            ResolutionStrategy::Merged => "merged",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" | "keep_local" => Some(ResolutionStrategy::Local),
            "remote" | "keep_remote" => Some(ResolutionStrategy::Remote),
            "merged" | "merge" => Some(ResolutionStrategy::Merged),
            _ => None,
        }
    }
}

/// 冲突条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictItem {
    pub id: String,
    pub project_id: String,
    /// `tag#id`
    pub entity_id: String,
    pub local_data: Value,
    pub remote_data: Value,
    pub conflicted_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<ResolutionStrategy>,
}

/// 已解决的冲突；`payload` 成为新的本地权威状态
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConflict {
    pub item: ConflictItem,
    pub payload: Value,
}

impl ResolvedConflict {
    /// 将解决结果写入集合；`null` 表示该任务被删除
    pub fn apply_to(&self, collection: &mut TaskCollection) -> SyncResult<()> {
        let task_ref = TaskRef::parse_entity_id(&self.item.entity_id).ok_or_else(|| {
            SyncError::validation(format!("无法解析实体 ID: {}", self.item.entity_id))
        })?;
        if self.payload.is_null() {
            collection.remove(&task_ref.tag, &task_ref.id);
            return Ok(());
        }
        let mut task: TaskRecord = serde_json::from_value(self.payload.clone())
            .map_err(|e| SyncError::validation(format!("冲突解决结果不是合法任务: {}", e)))?;
        if task.id != task_ref.id {
            return Err(SyncError::validation(format!(
                "冲突解决结果的任务 ID {} 与实体 {} 不一致",
                task.id, self.item.entity_id
            )));
        }
        task.tag = task_ref.tag;
        collection.upsert(task);
        Ok(())
    }
}

/// 冲突仓库
#[derive(Clone)]
pub struct ConflictStore {
    store: SyncStore,
}

impl ConflictStore {
    const SELECT_COLUMNS: &'static str =
        "id, project_id, entity_id, local_data, remote_data, conflicted_at, resolved, resolved_at, resolution";

    pub fn new(store: SyncStore) -> Self {
        Self { store }
    }

    /// 记录冲突；同一项目内同一实体已有未解决冲突时只替换其远端数据
    pub async fn record_conflict(
        &self,
        project_id: &str,
        entity_id: &str,
        local_data: Value,
        remote_data: Value,
    ) -> SyncResult<ConflictItem> {
        let (project_id, entity_id) = (project_id.to_string(), entity_id.to_string());
        self.store
            .call(move |conn| {
                Self::record_blocking(conn, &project_id, &entity_id, &local_data, &remote_data)
            })
            .await
    }

    pub(crate) fn record_blocking(
        conn: &Connection,
        project_id: &str,
        entity_id: &str,
        local_data: &Value,
        remote_data: &Value,
    ) -> SyncResult<ConflictItem> {
        if project_id.trim().is_empty() {
            return Err(SyncError::validation("project_id 不能为空"));
        }
        if entity_id.trim().is_empty() {
            return Err(SyncError::validation("entity_id 不能为空"));
        }
        let remote_json = serde_json::to_string(remote_data)?;
        if let Some(existing) = Self::find_unresolved(conn, project_id, entity_id)? {
            conn.execute(
                "UPDATE conflict_items SET remote_data = ?2 WHERE id = ?1",
                params![existing.id, remote_json],
            )?;
            info!(
                "[ConflictStore] 项目 {} 实体 {} 已有未解决冲突 {}，更新远端数据",
                project_id, entity_id, existing.id
            );
            return Ok(ConflictItem {
                remote_data: remote_data.clone(),
                ..existing
            });
        }

        let item = ConflictItem {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            entity_id: entity_id.to_string(),
            local_data: local_data.clone(),
            remote_data: remote_data.clone(),
            conflicted_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolution: None,
        };
        conn.execute(
            "INSERT INTO conflict_items (id, project_id, entity_id, local_data, remote_data, conflicted_at, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                item.id,
                item.project_id,
                item.entity_id,
                serde_json::to_string(local_data)?,
                remote_json,
                item.conflicted_at.to_rfc3339(),
            ],
        )?;
        info!(
            "[ConflictStore] 记录冲突 {} (项目 {} 实体 {})",
            item.id, project_id, entity_id
        );
        Ok(item)
    }

    /// 解决冲突
    ///
    /// `merged` 必须携带合并后的数据；已解决的冲突不能再次解决。
    pub async fn resolve(
        &self,
        id: &str,
        strategy: ResolutionStrategy,
        merged_payload: Option<Value>,
    ) -> SyncResult<ResolvedConflict> {
        let id = id.to_string();
        self.store
            .call(move |conn| Self::resolve_blocking(conn, &id, strategy, merged_payload))
            .await
    }

    fn resolve_blocking(
        conn: &Connection,
        id: &str,
        strategy: ResolutionStrategy,
        merged_payload: Option<Value>,
    ) -> SyncResult<ResolvedConflict> {
        let item = Self::get_blocking(conn, id)?
            .ok_or_else(|| SyncError::not_found(format!("冲突不存在: {}", id)))?;
        if item.resolved {
            return Err(SyncError::validation(format!("冲突 {} 已解决", id)));
        }
        let payload = match strategy {
            ResolutionStrategy::Local => item.local_data.clone(),
            ResolutionStrategy::Remote => item.remote_data.clone(),
            ResolutionStrategy::Merged => merged_payload.ok_or_else(|| {
                SyncError::validation("merged 解决方式必须提供合并后的数据")
            })?,
        };

        let resolved_at = Utc::now();
        let changed = conn.execute(
            "UPDATE conflict_items SET resolved = 1, resolved_at = ?2, resolution = ?3
             WHERE id = ?1 AND resolved = 0",
            params![id, resolved_at.to_rfc3339(), strategy.as_str()],
        )?;
        if changed == 0 {
            return Err(SyncError::validation(format!("冲突 {} 已解决", id)));
        }
        info!(
            "[ConflictStore] 冲突 {} 已按 {} 解决 (实体 {})",
            id,
            strategy.as_str(),
            item.entity_id
        );
        Ok(ResolvedConflict {
            item: ConflictItem {
                resolved: true,
                resolved_at: Some(resolved_at),
                resolution: Some(strategy),
                ..item
            },
            payload,
        })
    }

    pub async fn get(&self, id: &str) -> SyncResult<Option<ConflictItem>> {
        let id = id.to_string();
        self.store.call(move |conn| Self::get_blocking(conn, &id)).await
    }

    pub async fn list_unresolved(&self, project_id: &str) -> SyncResult<Vec<ConflictItem>> {
        let project_id = project_id.to_string();
        self.store
            .call(move |conn| Self::list_unresolved_blocking(conn, &project_id))
            .await
    }

    pub async fn has_unresolved(&self, project_id: &str, entity_id: &str) -> SyncResult<bool> {
        let (project_id, entity_id) = (project_id.to_string(), entity_id.to_string());
        self.store
            .call(move |conn| Ok(Self::find_unresolved(conn, &project_id, &entity_id)?.is_some()))
            .await
    }

    /// 项目内存在未解决冲突的任务，供合并器跳过
    pub async fn blocked_ids(&self, project_id: &str) -> SyncResult<HashSet<TaskRef>> {
        let items = self.list_unresolved(project_id).await?;
        let mut out = HashSet::new();
        for item in items {
            match TaskRef::parse_entity_id(&item.entity_id) {
                Some(task_ref) => {
                    out.insert(task_ref);
                }
                None => warn!(
                    "[ConflictStore] 冲突 {} 的实体 ID 无法解析: {}",
                    item.id, item.entity_id
                ),
            }
        }
        Ok(out)
    }

    fn get_blocking(conn: &Connection, id: &str) -> SyncResult<Option<ConflictItem>> {
        let sql = format!("SELECT {} FROM conflict_items WHERE id = ?1", Self::SELECT_COLUMNS);
        conn.query_row(&sql, params![id], Self::row_to_item)
            .optional()?
            .transpose()
    }

    fn find_unresolved(
        conn: &Connection,
        project_id: &str,
        entity_id: &str,
    ) -> SyncResult<Option<ConflictItem>> {
        let sql = format!(
            "SELECT {} FROM conflict_items WHERE project_id = ?1 AND entity_id = ?2 AND resolved = 0
             ORDER BY conflicted_at ASC LIMIT 1",
            Self::SELECT_COLUMNS
        );
        conn.query_row(&sql, params![project_id, entity_id], Self::row_to_item)
            .optional()?
            .transpose()
    }

    fn list_unresolved_blocking(conn: &Connection, project_id: &str) -> SyncResult<Vec<ConflictItem>> {
        let sql = format!(
            "SELECT {} FROM conflict_items WHERE project_id = ?1 AND resolved = 0
             ORDER BY conflicted_at ASC",
            Self::SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![project_id], Self::row_to_item)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    fn row_to_item(row: &Row) -> rusqlite::Result<SyncResult<ConflictItem>> {
        let id: String = row.get(0)?;
        let project_id: String = row.get(1)?;
        let entity_id: String = row.get(2)?;
        let local_data: String = row.get(3)?;
        let remote_data: String = row.get(4)?;
        let conflicted_at: String = row.get(5)?;
        let resolved: i64 = row.get(6)?;
        let resolved_at: Option<String> = row.get(7)?;
        let resolution: Option<String> = row.get(8)?;
        Ok((|| -> SyncResult<ConflictItem> {
            Ok(ConflictItem {
                id,
                project_id,
                entity_id,
                local_data: serde_json::from_str(&local_data)?,
                remote_data: serde_json::from_str(&remote_data)?,
                conflicted_at: parse_time(&conflicted_at)?,
                resolved: resolved != 0,
                resolved_at: resolved_at.as_deref().map(parse_time).transpose()?,
                resolution: resolution.as_deref().and_then(ResolutionStrategy::from_str),
            })
        })())
    }
}

fn parse_time(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::database(format!("时间戳解析失败: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn store() -> ConflictStore {
        ConflictStore::new(SyncStore::in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_second_conflict_replaces_remote_side() {
        let conflicts = store();
        let first = conflicts
            .record_conflict("p1", "master#1", json!({"id": 1, "title": "L"}), json!({"id": 1, "title": "R1"}))
            .await
            .unwrap();
        let second = conflicts
            .record_conflict("p1", "master#1", json!({"id": 1, "title": "L"}), json!({"id": 1, "title": "R2"}))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let unresolved = conflicts.list_unresolved("p1").await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].remote_data["title"], "R2");
        assert!(conflicts.has_unresolved("p1", "master#1").await.unwrap());
        assert!(!conflicts.has_unresolved("p1", "master#2").await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_strategies() {
        let conflicts = store();
        let a = conflicts
            .record_conflict("p1", "master#1", json!({"id": 1, "title": "L"}), json!({"id": 1, "title": "R"}))
            .await
            .unwrap();
        let b = conflicts
            .record_conflict("p1", "master#2", json!({"id": 2, "title": "L"}), json!({"id": 2, "title": "R"}))
            .await
            .unwrap();
        let c = conflicts
            .record_conflict("p1", "master#3", json!({"id": 3, "title": "L"}), json!({"id": 3, "title": "R"}))
            .await
            .unwrap();

        let ra = conflicts.resolve(&a.id, ResolutionStrategy::Local, None).await.unwrap();
        assert_eq!(ra.payload["title"], "L");
        let rb = conflicts.resolve(&b.id, ResolutionStrategy::Remote, None).await.unwrap();
        assert_eq!(rb.payload["title"], "R");
        let rc = conflicts
            .resolve(&c.id, ResolutionStrategy::Merged, Some(json!({"id": 3, "title": "L+R"})))
            .await
            .unwrap();
        assert_eq!(rc.item.resolution, Some(ResolutionStrategy::Merged));
        assert!(rc.item.resolved);

        let mut collection = TaskCollection::from_tasks("master", vec![TaskRecord::new(3u64, "master", "L")]);
        rc.apply_to(&mut collection).unwrap();
        assert_eq!(collection.tasks("master")[0].title, "L+R");
        assert_eq!(collection.tasks("master")[0].tag, "master");

        assert!(conflicts.list_unresolved("p1").await.unwrap().is_empty());
        let stored = conflicts.get(&c.id).await.unwrap().unwrap();
        assert!(stored.resolved);
        assert!(stored.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_merged_requires_payload_and_resolve_once() {
        let conflicts = store();
        let item = conflicts
            .record_conflict("p1", "master#1", json!({"id": 1}), json!({"id": 1, "title": "R"}))
            .await
            .unwrap();
        assert_matches!(
            conflicts.resolve(&item.id, ResolutionStrategy::Merged, None).await,
            Err(SyncError::Validation(_))
        );
        conflicts.resolve(&item.id, ResolutionStrategy::Remote, None).await.unwrap();
        assert_matches!(
            conflicts.resolve(&item.id, ResolutionStrategy::Local, None).await,
            Err(SyncError::Validation(_))
        );
        assert_matches!(
            conflicts.resolve("missing", ResolutionStrategy::Local, None).await,
            Err(SyncError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_blocked_ids() {
        let conflicts = store();
        conflicts
            .record_conflict("p1", "feature#7", json!(null), json!({"id": 7}))
            .await
            .unwrap();
        let blocked = conflicts.blocked_ids("p1").await.unwrap();
        assert!(blocked.contains(&TaskRef::new("feature", 7u64)));
    }

    #[tokio::test]
    async fn test_conflicts_are_scoped_to_project() {
        let conflicts = store();
        let p1 = conflicts
            .record_conflict("p1", "master#1", json!({"id": 1}), json!({"id": 1, "title": "R"}))
            .await
            .unwrap();
        assert!(conflicts.blocked_ids("p2").await.unwrap().is_empty());
        assert!(conflicts.list_unresolved("p2").await.unwrap().is_empty());
        assert!(!conflicts.has_unresolved("p2", "master#1").await.unwrap());

        // 另一个项目的同名实体是独立的冲突
        let p2 = conflicts
            .record_conflict("p2", "master#1", json!({"id": 1}), json!({"id": 1, "title": "R2"}))
            .await
            .unwrap();
        assert_ne!(p1.id, p2.id);
        assert_eq!(p2.project_id, "p2");
        assert_eq!(conflicts.list_unresolved("p1").await.unwrap()[0].remote_data["title"], "R");
        assert_matches!(
            conflicts.record_conflict("", "master#1", json!(null), json!(null)).await,
            Err(SyncError::Validation(_))
        );
    }

    #[test]
    fn test_apply_rejects_mismatched_id() {
        let resolved = ResolvedConflict {
            item: ConflictItem {
                id: "c1".into(),
                project_id: "p1".into(),
                entity_id: "master#1".into(),
                local_data: json!(null),
                remote_data: json!(null),
                conflicted_at: Utc::now(),
                resolved: true,
                resolved_at: Some(Utc::now()),
                resolution: Some(ResolutionStrategy::Merged),
            },
            payload: json!({"id": 2, "title": "wrong"}),
        };
        let mut collection = TaskCollection::new();
        assert_matches!(resolved.apply_to(&mut collection), Err(SyncError::Validation(_)));
    }
}
