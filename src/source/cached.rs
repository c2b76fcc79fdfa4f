//! 缓存快照读取器

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ProjectDescriptor, SourceKind, SourceReader};
use crate::error::{SyncError, SyncResult};
use crate::models::TaskCollection;
use crate::store::{StateRepository, SyncStore};

/// 返回 (project, user) 上一次持久化的 `sync_data`，没有时返回空集合
#[derive(Clone)]
pub struct CachedReader {
    store: SyncStore,
}

impl CachedReader {
    pub fn new(store: SyncStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl SourceReader for CachedReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Cached
    }

    async fn read(
        &self,
        project: &ProjectDescriptor,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<TaskCollection> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled("缓存读取已取消".into()));
        }
        let project_id = project.project_id.clone();
        let user_id = user_id.to_string();
        let snapshot = self
            .store
            .call(move |conn| StateRepository::latest_snapshot(conn, &project_id, &user_id))
            .await?;
        debug!(
            "[CachedSource] 项目 {} 缓存快照: {}",
            project.project_id,
            if snapshot.is_some() { "命中" } else { "为空" }
        );
        Ok(snapshot.unwrap_or_default())
    }
}
