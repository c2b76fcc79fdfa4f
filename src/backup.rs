//! 备份管理
//!
//! 每次破坏性写入前，在同目录下生成 `<file>.backup-<unixMillis>.json` 的
//! 逐字节副本。备份和恢复都先写临时文件、fsync、校验 SHA-256，
//! 再 rename 到最终位置，目标文件不会出现半写状态。
//!
//! 备份不会被自动删除，保留策略由外部决定。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::source::local::parent_dir;

const BACKUP_MARKER: &str = ".backup-";
const BACKUP_SUFFIX: &str = ".json";

/// 备份文件信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub path: PathBuf,
    pub created_at_millis: i64,
    pub size: u64,
}

/// 计算文件的 SHA-256
pub fn calculate_file_hash(path: &Path) -> SyncResult<String> {
    let file = File::open(path)
        .map_err(|e| SyncError::read(format!("打开文件计算哈希失败 {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| SyncError::read(format!("读取文件失败 {}: {}", path.display(), e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn file_name(path: &Path) -> SyncResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SyncError::validation(format!("无效的文件路径: {}", path.display())))
}

/// 从备份文件名中解析时间戳；不是 `target` 的备份时返回 `None`
fn backup_millis(target_name: &str, candidate: &str) -> Option<i64> {
    let rest = candidate.strip_prefix(target_name)?;
    let millis = rest.strip_prefix(BACKUP_MARKER)?.strip_suffix(BACKUP_SUFFIX)?;
    if millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    millis.parse().ok()
}

/// 写入同目录临时文件、fsync 并校验内容哈希
fn write_verified(dir: &Path, bytes: &[u8], expected_hash: &str) -> SyncResult<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| SyncError::write(format!("创建临时文件失败 {}: {}", dir.display(), e)))?;
    tmp.write_all(bytes)
        .map_err(|e| SyncError::write(format!("写入临时文件失败: {}", e)))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| SyncError::write(format!("fsync 失败: {}", e)))?;
    let written = calculate_file_hash(tmp.path())?;
    if written != expected_hash {
        return Err(SyncError::write(format!(
            "校验失败: 期望 {}, 实际 {}",
            expected_hash, written
        )));
    }
    Ok(tmp)
}

/// 备份管理器
#[derive(Debug, Clone, Default)]
pub struct BackupManager;

impl BackupManager {
    pub fn new() -> Self {
        Self
    }

    /// 为 `path` 创建逐字节备份，返回备份路径
    pub fn snapshot(&self, path: &Path) -> SyncResult<PathBuf> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::not_found(format!(
                    "待备份文件不存在: {}",
                    path.display()
                )))
            }
            Err(e) => {
                return Err(SyncError::read(format!(
                    "读取待备份文件失败 {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let hash = hash_bytes(&bytes);
        let dir = parent_dir(path);
        let name = file_name(path)?;
        let mut tmp = write_verified(&dir, &bytes, &hash)?;

        let mut millis = Utc::now().timestamp_millis();
        loop {
            let candidate = dir.join(format!("{}{}{}{}", name, BACKUP_MARKER, millis, BACKUP_SUFFIX));
            if candidate.exists() {
                millis += 1;
                continue;
            }
            match tmp.persist_noclobber(&candidate) {
                Ok(_) => {
                    info!(
                        "[BackupManager] 已创建备份: {} ({} bytes, sha256={})",
                        candidate.display(),
                        bytes.len(),
                        &hash[..12]
                    );
                    return Ok(candidate);
                }
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    tmp = e.file;
                    millis += 1;
                }
                Err(e) => {
                    return Err(SyncError::write(format!(
                        "保存备份失败 {}: {}",
                        candidate.display(),
                        e.error
                    )))
                }
            }
        }
    }

    /// 用备份覆盖目标文件
    pub fn restore(&self, backup_path: &Path, target: &Path) -> SyncResult<()> {
        let bytes = match std::fs::read(backup_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::not_found(format!(
                    "备份文件不存在: {}",
                    backup_path.display()
                )))
            }
            Err(e) => {
                return Err(SyncError::read(format!(
                    "读取备份失败 {}: {}",
                    backup_path.display(),
                    e
                )))
            }
        };
        let hash = hash_bytes(&bytes);
        let dir = parent_dir(target);
        std::fs::create_dir_all(&dir)
            .map_err(|e| SyncError::write(format!("创建目录失败 {}: {}", dir.display(), e)))?;
        let tmp = write_verified(&dir, &bytes, &hash)?;
        tmp.persist(target).map_err(|e| {
            SyncError::write(format!("恢复备份失败 {}: {}", target.display(), e.error))
        })?;
        info!(
            "[BackupManager] 已从 {} 恢复 {}",
            backup_path.display(),
            target.display()
        );
        Ok(())
    }

    /// `path` 的全部备份，最新的在前
    pub fn list_backups(&self, path: &Path) -> SyncResult<Vec<BackupInfo>> {
        let dir = parent_dir(path);
        let name = file_name(path)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let candidate = entry.file_name().to_string_lossy().into_owned();
            let Some(millis) = backup_millis(&name, &candidate) else {
                continue;
            };
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            backups.push(BackupInfo {
                path: entry.path(),
                created_at_millis: millis,
                size: meta.len(),
            });
        }
        backups.sort_by(|a, b| b.created_at_millis.cmp(&a.created_at_millis));
        debug!(
            "[BackupManager] {} 共有 {} 个备份",
            path.display(),
            backups.len()
        );
        Ok(backups)
    }

    /// `backup_path` 是否为 `target` 的同目录备份
    pub fn is_backup_of(&self, backup_path: &Path, target: &Path) -> bool {
        let (Some(name), Ok(target_name)) = (backup_path.file_name(), file_name(target)) else {
            return false;
        };
        parent_dir(backup_path) == parent_dir(target)
            && backup_millis(&target_name, &name.to_string_lossy()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_snapshot_is_byte_exact() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tasks.json");
        write(&target, "{\n  \"master\": {\"tasks\": []}\n}\n");

        let backup = BackupManager::new().snapshot(&target).unwrap();
        assert_eq!(std::fs::read(&backup).unwrap(), std::fs::read(&target).unwrap());
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tasks.json.backup-"));
        assert!(name.ends_with(".json"));
        assert_eq!(
            calculate_file_hash(&backup).unwrap(),
            calculate_file_hash(&target).unwrap()
        );
    }

    #[test]
    fn test_snapshot_names_are_unique() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tasks.json");
        write(&target, "[]");
        let manager = BackupManager::new();
        let a = manager.snapshot(&target).unwrap();
        let b = manager.snapshot(&target).unwrap();
        let c = manager.snapshot(&target).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);

        let listed = manager.list_backups(&target).unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed[0].created_at_millis > listed[2].created_at_millis);
        assert!(listed.iter().all(|b| manager.is_backup_of(&b.path, &target)));
    }

    #[test]
    fn test_restore_after_corruption() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tasks.json");
        write(&target, "[{\"id\": 1, \"title\": \"A\"}]");
        let manager = BackupManager::new();
        let backup = manager.snapshot(&target).unwrap();

        write(&target, "{ corrupted");
        manager.restore(&backup, &target).unwrap();
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "[{\"id\": 1, \"title\": \"A\"}]"
        );
    }

    #[test]
    fn test_missing_files() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("tasks.json");
        let manager = BackupManager::new();
        assert_matches!(manager.snapshot(&target), Err(SyncError::NotFound(_)));
        assert_matches!(
            manager.restore(&dir.path().join("tasks.json.backup-1.json"), &target),
            Err(SyncError::NotFound(_))
        );
        assert!(manager.list_backups(&target).unwrap().is_empty());
    }

    #[test]
    fn test_is_backup_of_rejects_foreign_files() {
        let manager = BackupManager::new();
        let target = Path::new("/p/.taskmaster/tasks/tasks.json");
        assert!(manager.is_backup_of(
            Path::new("/p/.taskmaster/tasks/tasks.json.backup-1700000000000.json"),
            target
        ));
        assert!(!manager.is_backup_of(Path::new("/etc/passwd"), target));
        assert!(!manager.is_backup_of(
            Path::new("/other/tasks.json.backup-1700000000000.json"),
            target
        ));
        assert!(!manager.is_backup_of(
            Path::new("/p/.taskmaster/tasks/tasks.json.backup-abc.json"),
            target
        ));
    }
}
