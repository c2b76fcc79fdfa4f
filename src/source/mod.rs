//! # Source 模块
//!
//! 任务集合的读取与写回。
//!
//! - `local`: 本地文件系统上的 tasks.json
//! - `ssh`: 通过 SSH 读取远程主机上的 tasks.json
//! - `cached`: 数据库中上一次持久化的快照
//! - `format`: 三种历史文件形态的解析与规范化输出
//! - `resolver`: 项目目录与路径解析（外部协作者接口）

pub mod cached;
pub mod format;
pub mod local;
pub mod resolver;
pub mod ssh;

pub use cached::CachedReader;
pub use format::{parse_document, render_document, ParsedDocument};
pub use local::{write_collection, LocalFileSink, LocalReader};
pub use resolver::{
    ConfiguredPathResolver, PathResolver, ProjectDirectory, ProjectEntry, StaticProjectDirectory,
};
pub use ssh::{CommandOutput, OpenSshShell, RemoteSession, RemoteShell, SshReader, SshTarget};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::error::SyncResult;
use crate::models::{TaskCollection, DEFAULT_TAG};

/// 数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Local,
    Ssh,
    Cached,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Local => "local",
            SourceKind::Ssh => "ssh",
            SourceKind::Cached => "cached",
        }
    }
}

/// 已解析的项目
#[derive(Debug, Clone)]
pub struct ProjectDescriptor {
    pub project_id: String,
    pub name: String,
    /// 本地项目根目录
    pub root: PathBuf,
    /// 非 master 分区使用独立目录 `.taskmaster-<tag>`
    pub tag: Option<String>,
    pub remote: Option<SshTarget>,
}

impl ProjectDescriptor {
    /// 本地任务文件路径
    pub fn tasks_path(&self) -> PathBuf {
        self.root.join(relative_tasks_path(self.tag.as_deref()))
    }
}

/// `.taskmaster[-<tag>]/tasks/tasks.json`
pub fn relative_tasks_path(tag: Option<&str>) -> PathBuf {
    let dir = match tag {
        Some(tag) if !tag.is_empty() && tag != DEFAULT_TAG => format!(".taskmaster-{}", tag),
        _ => ".taskmaster".to_string(),
    };
    Path::new(&dir).join("tasks").join("tasks.json")
}

/// 任务集合读取器
#[async_trait::async_trait]
pub trait SourceReader: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// 读取项目的任务集合
    ///
    /// 失败时返回 `NotFound` / `Read` / `Auth` / `Timeout`；取消时返回 `Cancelled`。
    async fn read(
        &self,
        project: &ProjectDescriptor,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<TaskCollection>;
}

/// 合并结果的写入目标
#[async_trait::async_trait]
pub trait TaskSink: Send + Sync {
    async fn write(&self, path: &Path, collection: &TaskCollection) -> SyncResult<()>;
}
