//! 按 (project_id, target_path) 的互斥
//!
//! 同一目标文件的备份/写入序列不会交错。tokio 的 Mutex 是公平锁，
//! 排队策略下等待者按 FIFO 获得锁。最后一个持有者释放后条目从表中移除。

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::ConcurrencyPolicy;
use crate::error::{SyncError, SyncResult};

type LockKey = (String, PathBuf);
type LockMap = DashMap<LockKey, Arc<Mutex<()>>>;

/// 持有期间独占该项目目标文件
#[derive(Debug)]
pub struct ProjectLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: LockKey,
    locks: Arc<LockMap>,
}

impl Drop for ProjectLockGuard {
    fn drop(&mut self) {
        // 先释放锁，再看是否还有等待者引用该条目
        drop(self.guard.take());
        let removed = self
            .locks
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1)
            .is_some();
        if removed {
            debug!("[SyncCoordinator] 释放项目 {} 的锁条目", self.key.0);
        }
    }
}

#[derive(Debug, Default)]
pub struct ProjectLocks {
    locks: Arc<LockMap>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, project_id: &str, target: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry((project_id.to_string(), target.to_path_buf()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn acquire(
        &self,
        project_id: &str,
        target: &Path,
        policy: ConcurrencyPolicy,
    ) -> SyncResult<ProjectLockGuard> {
        let key = (project_id.to_string(), target.to_path_buf());
        let slot = self.slot(project_id, target);
        let guard = match policy {
            ConcurrencyPolicy::Reject => slot.try_lock_owned().map_err(|_| {
                SyncError::AlreadyRunning {
                    project_id: project_id.to_string(),
                    path: target.display().to_string(),
                }
            })?,
            ConcurrencyPolicy::Queue => {
                debug!("[SyncCoordinator] 等待项目 {} 的同步锁", project_id);
                slot.lock_owned().await
            }
        };
        Ok(ProjectLockGuard {
            guard: Some(guard),
            key,
            locks: self.locks.clone(),
        })
    }

    /// 目标当前是否被占用
    pub fn is_locked(&self, project_id: &str, target: &Path) -> bool {
        self.locks
            .get(&(project_id.to_string(), target.to_path_buf()))
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// 表中登记的目标数
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reject_policy() {
        let locks = ProjectLocks::new();
        let target = Path::new("/p/.taskmaster/tasks/tasks.json");
        let guard = locks
            .acquire("p1", target, ConcurrencyPolicy::Reject)
            .await
            .unwrap();
        assert!(locks.is_locked("p1", target));
        assert_matches!(
            locks.acquire("p1", target, ConcurrencyPolicy::Reject).await,
            Err(SyncError::AlreadyRunning { .. })
        );
        // 不同目标互不影响
        assert!(locks
            .acquire("p1", Path::new("/other/tasks.json"), ConcurrencyPolicy::Reject)
            .await
            .is_ok());
        drop(guard);
        assert!(!locks.is_locked("p1", target));
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_queue_policy_waits() {
        let locks = Arc::new(ProjectLocks::new());
        let target = PathBuf::from("/p/tasks.json");
        let guard = locks
            .acquire("p1", &target, ConcurrencyPolicy::Queue)
            .await
            .unwrap();

        let waiter = {
            let locks = locks.clone();
            let target = target.clone();
            tokio::spawn(async move {
                locks
                    .acquire("p1", &target, ConcurrencyPolicy::Queue)
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        // 等待者仍引用该条目，不能被移除
        waiter.await.unwrap().unwrap();
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_guard_is_debuggable() {
        let locks = ProjectLocks::new();
        let guard = locks
            .acquire("p1", Path::new("/p/tasks.json"), ConcurrencyPolicy::Reject)
            .await
            .unwrap();
        assert!(format!("{:?}", guard).contains("p1"));
        assert_eq!(locks.tracked(), 1);
    }
}
