//! # Store 模块
//!
//! 同步状态的持久化层（数据库镜像）。
//!
//! ## 表结构
//!
//! - `sync_state`: 每个 (project, user, source_kind) 一行，仅由协调器修改
//! - `sync_history`: 只追加的审计行，RUNNING 创建、恰好终结一次
//! - `conflict_items`: 离线客户端待手动解决的冲突
//!
//! 连接通过 r2d2 连接池获取；内存库仅用于测试，池大小固定为 1，
//! 保证所有连接看到同一个库。

pub mod history;
pub mod state;

pub use history::{
    HistoryCounts, HistoryRepository, HistoryStatus, SyncHistoryRow, SyncType, SCAN_SCOPE,
};
pub use state::{StateRepository, SyncStateKey, SyncStateRecord, SyncStatus};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS sync_state (
        project_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        source_kind TEXT NOT NULL,
        status TEXT NOT NULL,
        last_sync_at TEXT,
        error_message TEXT,
        sync_data TEXT,
        remote_baseline TEXT,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (project_id, user_id, source_kind)
    );

    CREATE TABLE IF NOT EXISTS sync_history (
        id TEXT PRIMARY KEY NOT NULL,
        project_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        sync_type TEXT NOT NULL,
        status TEXT NOT NULL,
        tasks_added INTEGER NOT NULL DEFAULT 0,
        tasks_updated INTEGER NOT NULL DEFAULT 0,
        tasks_removed INTEGER NOT NULL DEFAULT 0,
        sync_data TEXT,
        error_message TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_sync_history_project ON sync_history(project_id, started_at);
    CREATE INDEX IF NOT EXISTS idx_sync_history_status ON sync_history(status);

    CREATE TABLE IF NOT EXISTS conflict_items (
        id TEXT PRIMARY KEY NOT NULL,
        project_id TEXT NOT NULL DEFAULT '',
        entity_id TEXT NOT NULL,
        local_data TEXT NOT NULL,
        remote_data TEXT NOT NULL,
        conflicted_at TEXT NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        resolved_at TEXT,
        resolution TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_conflict_items_entity ON conflict_items(entity_id, resolved);
"#;

/// 旧库缺少的列：(表, 列, 列定义)
const COLUMN_PATCHES: &[(&str, &str, &str)] = &[
    ("sync_state", "remote_baseline", "TEXT"),
    ("conflict_items", "project_id", "TEXT NOT NULL DEFAULT ''"),
];

const POST_PATCH_SQL: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_conflict_items_project
        ON conflict_items(project_id, entity_id, resolved);
"#;

/// 同步持久化存储
#[derive(Clone)]
pub struct SyncStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SyncStore {
    /// 打开（或创建）文件数据库
    pub fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(path)
            .with_init(|c| c.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;"));
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| SyncError::database(format!("创建数据库连接池失败: {}", e)))?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.init()?;
        info!("[SyncStore] 已打开同步数据库: {}", path.display());
        Ok(store)
    }

    /// 内存数据库（测试用）
    pub fn in_memory() -> SyncResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)
            .map_err(|e| SyncError::database(format!("创建内存数据库失败: {}", e)))?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> SyncResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        for (table, column, definition) in COLUMN_PATCHES {
            ensure_column(&conn, table, column, definition)?;
        }
        conn.execute_batch(POST_PATCH_SQL)?;
        debug!("[SyncStore] schema 初始化完成");
        Ok(())
    }

    /// 获取连接；调用方不要跨 await 持有
    pub fn conn(&self) -> SyncResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// 在阻塞线程池中执行一次数据库操作
    pub async fn call<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> SyncResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = store.conn()?;
            f(&conn)
        })
        .await?
    }
}

fn ensure_column(conn: &Connection, table: &str, column: &str, definition: &str) -> SyncResult<()> {
    let exists: bool = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = ?1",
            table
        ),
        [column],
        |row| row.get::<_, i64>(0).map(|count| count > 0),
    )?;
    if !exists {
        info!("[SyncStore] {} 表缺少 {} 列，正在补齐", table, column);
        conn.execute(
            &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition),
            [],
        )?;
    }
    Ok(())
}
