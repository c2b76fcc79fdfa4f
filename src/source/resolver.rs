//! 项目目录与路径解析
//!
//! 项目的访问控制与本地路径属于外部协作者；这里只定义接口，
//! 并提供基于配置的静态实现。路径只来自显式配置，不做按名称猜测。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use super::{ProjectDescriptor, SshTarget};
use crate::error::{SyncError, SyncResult};

/// 配置中的项目条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub tag: Option<String>,
    /// 可访问的用户；为空表示不限
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub remote: Option<SshTarget>,
}

impl ProjectEntry {
    pub fn allows(&self, user_id: &str) -> bool {
        self.members.is_empty() || self.members.iter().any(|m| m == user_id)
    }
}

/// 项目本地根目录解析
pub trait PathResolver: Send + Sync {
    fn resolve_root(&self, entry: &ProjectEntry) -> SyncResult<PathBuf>;
}

/// 显式配置的路径解析
///
/// 优先级：`roots[project_id]` > 条目自身的 `root` > `base_dir/<name>`。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfiguredPathResolver {
    #[serde(default)]
    pub roots: HashMap<String, PathBuf>,
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
}

impl PathResolver for ConfiguredPathResolver {
    fn resolve_root(&self, entry: &ProjectEntry) -> SyncResult<PathBuf> {
        if let Some(root) = self.roots.get(&entry.id) {
            return Ok(root.clone());
        }
        if let Some(root) = &entry.root {
            return Ok(root.clone());
        }
        if let Some(base) = &self.base_dir {
            let name = Path::new(&entry.name);
            let mut components = name.components();
            let single_normal = matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            );
            if !single_normal {
                return Err(SyncError::validation(format!(
                    "项目名称不能作为目录名: {}",
                    entry.name
                )));
            }
            return Ok(base.join(name));
        }
        Err(SyncError::not_found(format!(
            "项目 {} 未配置本地路径",
            entry.id
        )))
    }
}

/// 项目访问控制
#[async_trait::async_trait]
pub trait ProjectDirectory: Send + Sync {
    /// 解析项目；无权访问返回 `Unauthorized`，不存在返回 `NotFound`
    async fn resolve(&self, project_id: &str, user_id: &str) -> SyncResult<ProjectDescriptor>;

    /// 用户可见的全部项目
    async fn list_for_user(&self, user_id: &str) -> SyncResult<Vec<ProjectDescriptor>>;
}

/// 基于配置的内存实现
pub struct StaticProjectDirectory {
    projects: Vec<ProjectEntry>,
    resolver: Arc<dyn PathResolver>,
}

impl StaticProjectDirectory {
    pub fn new(projects: Vec<ProjectEntry>, resolver: Arc<dyn PathResolver>) -> Self {
        Self { projects, resolver }
    }

    fn describe(&self, entry: &ProjectEntry) -> SyncResult<ProjectDescriptor> {
        Ok(ProjectDescriptor {
            project_id: entry.id.clone(),
            name: entry.name.clone(),
            root: self.resolver.resolve_root(entry)?,
            tag: entry.tag.clone(),
            remote: entry.remote.clone(),
        })
    }
}

#[async_trait::async_trait]
impl ProjectDirectory for StaticProjectDirectory {
    async fn resolve(&self, project_id: &str, user_id: &str) -> SyncResult<ProjectDescriptor> {
        let entry = self
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .ok_or_else(|| SyncError::not_found(format!("项目不存在: {}", project_id)))?;
        if !entry.allows(user_id) {
            return Err(SyncError::Unauthorized(format!(
                "用户 {} 无权访问项目 {}",
                user_id, project_id
            )));
        }
        self.describe(entry)
    }

    async fn list_for_user(&self, user_id: &str) -> SyncResult<Vec<ProjectDescriptor>> {
        let mut out = Vec::new();
        for entry in self.projects.iter().filter(|p| p.allows(user_id)) {
            match self.describe(entry) {
                Ok(descriptor) => out.push(descriptor),
                Err(e) => warn!("[ProjectDirectory] 跳过项目 {}: {}", entry.id, e),
            }
        }
        Ok(out)
    }
}
