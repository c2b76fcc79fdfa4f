//! 配置加载
//!
//! 来源（后者覆盖前者）：
//! 1. 各字段的默认值
//! 2. TOML 配置文件（默认 `config/task-sync.toml`，存在时加载）
//! 3. `TASK_SYNC__*` 环境变量，`__` 分隔层级，例如
//!    `TASK_SYNC__SCHEDULER__SYNC_CONCURRENCY=2`
//!
//! 启动前会先读取 `.env`。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::coordinator::CoordinatorConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::BroadcasterConfig;
use crate::jobs::SchedulerConfig;
use crate::source::{ConfiguredPathResolver, OpenSshShell, ProjectEntry, StaticProjectDirectory};

pub const ENV_PREFIX: &str = "TASK_SYNC";
pub const DEFAULT_CONFIG_FILE: &str = "config/task-sync.toml";

/// 以秒为单位（允许小数）的 Duration 序列化
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(
                "duration must be a non-negative number of seconds",
            ));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// SSH 连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// 单次远程读取（含 test -f 与 cat）的总时限
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,
    pub strict_host_key_checking: bool,
    pub control_dir: PathBuf,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            strict_host_key_checking: true,
            control_dir: std::env::temp_dir(),
        }
    }
}

impl SshSettings {
    pub fn shell(&self) -> OpenSshShell {
        OpenSshShell {
            connect_timeout: self.connect_timeout,
            strict_host_key_checking: self.strict_host_key_checking,
            control_dir: self.control_dir.clone(),
        }
    }
}

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// SyncState / SyncHistory / ConflictItem 所在的 SQLite 文件
    pub database_path: PathBuf,
    /// tracing 过滤指令；`RUST_LOG` 优先
    pub log_filter: String,
    pub projects: Vec<ProjectEntry>,
    pub paths: ConfiguredPathResolver,
    pub ssh: SshSettings,
    pub coordinator: CoordinatorConfig,
    pub scheduler: SchedulerConfig,
    pub broadcaster: BroadcasterConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/task-sync.db"),
            log_filter: "info".to_string(),
            projects: Vec::new(),
            paths: ConfiguredPathResolver::default(),
            ssh: SshSettings::default(),
            coordinator: CoordinatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            broadcaster: BroadcasterConfig::default(),
        }
    }
}

fn config_error(e: config::ConfigError) -> SyncError {
    SyncError::Configuration(e.to_string())
}

impl SyncConfig {
    /// 从 `.env`、配置文件和环境变量加载
    ///
    /// `path` 显式给出时文件必须存在；否则仅在默认路径存在时加载。
    pub fn from_env_and_file(path: Option<&Path>) -> SyncResult<Self> {
        dotenvy::dotenv().ok();
        let mut builder = config::Config::builder();
        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => debug!("[Config] 未找到 {}，使用默认配置", DEFAULT_CONFIG_FILE),
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let loaded = builder.build().map_err(config_error)?;
        let cfg: SyncConfig = loaded.try_deserialize().map_err(config_error)?;
        cfg.validate()?;
        info!(
            "[Config] 配置已加载: {} 个项目, 数据库 {}",
            cfg.projects.len(),
            cfg.database_path.display()
        );
        Ok(cfg)
    }

    /// 解析 TOML 文本（不读取环境变量）
    pub fn from_toml_str(raw: &str) -> SyncResult<Self> {
        let loaded = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .map_err(config_error)?;
        let cfg: SyncConfig = loaded.try_deserialize().map_err(config_error)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> SyncResult<()> {
        let mut ids = HashSet::new();
        for project in &self.projects {
            if project.id.trim().is_empty() {
                return Err(SyncError::Configuration("项目 id 不能为空".into()));
            }
            if !ids.insert(project.id.as_str()) {
                return Err(SyncError::Configuration(format!(
                    "项目 id 重复: {}",
                    project.id
                )));
            }
            if let Some(remote) = &project.remote {
                if remote.host.trim().is_empty() || remote.remote_root.trim().is_empty() {
                    return Err(SyncError::Configuration(format!(
                        "项目 {} 的远程配置缺少 host 或 remote_root",
                        project.id
                    )));
                }
            }
        }
        if self.scheduler.max_attempts == 0 {
            return Err(SyncError::Configuration(
                "scheduler.max_attempts 至少为 1".into(),
            ));
        }
        if self.scheduler.sync_concurrency == 0 || self.scheduler.scan_concurrency == 0 {
            return Err(SyncError::Configuration("调度并发上限至少为 1".into()));
        }
        if self.broadcaster.channel_capacity == 0 || self.broadcaster.retry_queue_capacity == 0 {
            return Err(SyncError::Configuration("广播通道与重试队列容量至少为 1".into()));
        }
        for (name, value) in [
            ("ssh.read_timeout", self.ssh.read_timeout),
            ("ssh.connect_timeout", self.ssh.connect_timeout),
            ("coordinator.read_timeout", self.coordinator.read_timeout),
            ("broadcaster.heartbeat_interval", self.broadcaster.heartbeat_interval),
            ("broadcaster.tick_interval", self.broadcaster.tick_interval),
            ("scheduler.maintenance_interval", self.scheduler.maintenance_interval),
        ] {
            if value.is_zero() {
                return Err(SyncError::Configuration(format!("{} 不能为 0", name)));
            }
        }
        Ok(())
    }

    /// 基于配置的项目目录
    pub fn project_directory(&self) -> StaticProjectDirectory {
        StaticProjectDirectory::new(self.projects.clone(), Arc::new(self.paths.clone()))
    }
}
