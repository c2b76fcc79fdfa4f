//! 本地 tasks.json 的读取与原子写回

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::format::{parse_document, render_document, ParsedDocument};
use super::{ProjectDescriptor, SourceKind, SourceReader, TaskSink};
use crate::error::{SyncError, SyncResult};
use crate::models::TaskCollection;

/// 读取并解析任务文件
pub fn read_document(path: &Path) -> SyncResult<ParsedDocument> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SyncError::not_found(format!(
                "任务文件不存在: {}",
                path.display()
            )))
        }
        Err(e) => {
            return Err(SyncError::read(format!(
                "读取任务文件失败 {}: {}",
                path.display(),
                e
            )))
        }
    };
    parse_document(&raw)
}

/// 以按 tag 分区的形态原子写入
///
/// 先写同目录临时文件并 fsync，再 rename 覆盖目标；已有文件中分区块的
/// 附加字段会被保留。
pub fn write_collection(path: &Path, collection: &TaskCollection) -> SyncResult<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(&dir)
        .map_err(|e| SyncError::write(format!("创建目录失败 {}: {}", dir.display(), e)))?;

    let metadata = match read_document(path) {
        Ok(existing) => existing.tag_metadata,
        Err(_) => Default::default(),
    };
    let rendered = render_document(collection, &metadata)?;

    let mut tmp = NamedTempFile::new_in(&dir)
        .map_err(|e| SyncError::write(format!("创建临时文件失败: {}", e)))?;
    tmp.write_all(rendered.as_bytes())
        .map_err(|e| SyncError::write(format!("写入临时文件失败: {}", e)))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| SyncError::write(format!("fsync 失败: {}", e)))?;
    tmp.persist(path)
        .map_err(|e| SyncError::write(format!("替换任务文件失败 {}: {}", path.display(), e)))?;

    debug!(
        "[LocalSource] 已写入 {} 个任务到 {}",
        collection.total_tasks(),
        path.display()
    );
    Ok(())
}

pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// 本地文件读取器
#[derive(Debug, Default, Clone)]
pub struct LocalReader;

#[async_trait::async_trait]
impl SourceReader for LocalReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Local
    }

    async fn read(
        &self,
        project: &ProjectDescriptor,
        _user_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<TaskCollection> {
        let path = project.tasks_path();
        let task = tokio::task::spawn_blocking(move || read_document(&path));
        let parsed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled("本地读取已取消".into())),
            res = task => res??,
        };
        Ok(parsed.collection)
    }
}

/// 默认写入目标：本地文件
#[derive(Debug, Default, Clone)]
pub struct LocalFileSink;

#[async_trait::async_trait]
impl TaskSink for LocalFileSink {
    async fn write(&self, path: &Path, collection: &TaskCollection) -> SyncResult<()> {
        let path = path.to_path_buf();
        let collection = collection.clone();
        tokio::task::spawn_blocking(move || {
            write_collection(&path, &collection)?;
            info!("[LocalSource] 任务文件已更新: {}", path.display());
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TaskRecord, TaskStatus};
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;

    fn project(root: &Path) -> ProjectDescriptor {
        ProjectDescriptor {
            project_id: "p1".into(),
            name: "demo".into(),
            root: root.to_path_buf(),
            tag: None,
            remote: None,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = LocalReader
            .read(&project(dir.path()), "u1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::NotFound(ref msg) if msg.contains("tasks.json"));
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let p = project(dir.path());
        let mut task = TaskRecord::new(3u64, "master", "Ship it");
        task.status = TaskStatus::InProgress;
        let collection = TaskCollection::from_tasks("master", vec![task]);

        LocalFileSink.write(&p.tasks_path(), &collection).await.unwrap();
        let back = LocalReader
            .read(&p, "u1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(back, collection);
    }

    #[test]
    fn test_write_preserves_tag_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "tasks": [{"id": 1, "title": "A"}],
                "metadata": {"projectName": "demo"}
            }))
            .unwrap(),
        )
        .unwrap();

        let mut parsed = read_document(&path).unwrap();
        parsed
            .collection
            .upsert(TaskRecord::new(2u64, "master", "B"));
        write_collection(&path, &parsed.collection).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["master"]["metadata"]["projectName"], json!("demo"));
        assert_eq!(value["master"]["tasks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = LocalReader
            .read(&project(dir.path()), "u1", &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::Cancelled(_));
    }
}
