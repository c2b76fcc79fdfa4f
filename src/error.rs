//! 统一错误类型
//!
//! 同步引擎所有组件共用的错误分类。读取器/备份管理器抛出带类型的错误，
//! 协调器统一捕获后转换为可读的、带分类的错误返回给调用方。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 同步引擎 Result 别名
pub type SyncResult<T> = Result<T, SyncError>;

/// 同步引擎错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// SSH 认证失败或未配置凭据
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 调用方无权访问该项目
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 资源不存在（任务文件、备份、项目等）
    #[error("Not found: {0}")]
    NotFound(String),

    /// 源数据无法读取或格式错误
    #[error("Read error: {0}")]
    Read(String),

    /// 磁盘写入失败
    #[error("Write error: {0}")]
    Write(String),

    /// 严格策略下的不可调和冲突
    #[error("Conflict detected: {count} task(s) diverged ({ids})")]
    Conflict { count: usize, ids: String },

    /// 远程读取或任务执行超时
    #[error("Timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    /// 请求参数不合法
    #[error("Validation error: {0}")]
    Validation(String),

    /// 同一项目已有同步在运行
    #[error("Sync already running for project {project_id} ({path})")]
    AlreadyRunning { project_id: String, path: String },

    /// 操作被取消
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// 持久化层错误
    #[error("Database error: {0}")]
    Database(String),

    /// 其他 IO 错误
    #[error("IO error: {0}")]
    Io(String),

    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// 面向 UI 层的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Unauthorized,
    NotFound,
    BadRequest,
    Internal,
}

impl SyncError {
    pub fn read(message: impl Into<String>) -> Self {
        SyncError::Read(message.into())
    }

    pub fn write(message: impl Into<String>) -> Self {
        SyncError::Write(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        SyncError::NotFound(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation(message.into())
    }

    pub fn database(message: impl Into<String>) -> Self {
        SyncError::Database(message.into())
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        SyncError::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// 稳定的错误码，供前端按 code 做差异化处理
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Auth(_) => "AUTH_ERROR",
            SyncError::Unauthorized(_) => "UNAUTHORIZED",
            SyncError::NotFound(_) => "NOT_FOUND",
            SyncError::Read(_) => "READ_ERROR",
            SyncError::Write(_) => "WRITE_ERROR",
            SyncError::Conflict { .. } => "CONFLICT",
            SyncError::Timeout { .. } => "TIMEOUT",
            SyncError::Validation(_) => "VALIDATION_ERROR",
            SyncError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            SyncError::Cancelled(_) => "CANCELLED",
            SyncError::Database(_) => "DATABASE_ERROR",
            SyncError::Io(_) => "IO_ERROR",
            SyncError::Serialization(_) => "SERIALIZATION_ERROR",
            SyncError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// 映射到 unauthorized / not-found / bad-request / internal 四类
    pub fn classify(&self) -> ErrorClass {
        match self {
            SyncError::Auth(_) | SyncError::Unauthorized(_) => ErrorClass::Unauthorized,
            SyncError::NotFound(_) => ErrorClass::NotFound,
            SyncError::Validation(_)
            | SyncError::Conflict { .. }
            | SyncError::AlreadyRunning { .. } => ErrorClass::BadRequest,
            _ => ErrorClass::Internal,
        }
    }

    /// 是否值得由调度器重试
    ///
    /// 认证、校验、冲突等错误重试无意义，直接进入终态。
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Read(_)
                | SyncError::Timeout { .. }
                | SyncError::Database(_)
                | SyncError::Io(_)
                | SyncError::AlreadyRunning { .. }
        )
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            class: self.classify(),
            message: self.to_string(),
        }
    }
}

/// 序列化后的错误视图
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub class: ErrorClass,
    pub message: String,
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Database(format!("{:#}", e))
    }
}

impl From<r2d2::Error> for SyncError {
    fn from(e: r2d2::Error) -> Self {
        SyncError::Database(format!("连接池错误: {}", e))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Io(format!("后台任务异常退出: {}", e))
    }
}

impl From<SyncError> for String {
    fn from(e: SyncError) -> Self {
        serde_json::to_string(&e.to_payload()).unwrap_or_else(|_| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            SyncError::Auth("no key".into()).classify(),
            ErrorClass::Unauthorized
        );
        assert_eq!(
            SyncError::not_found("tasks.json").classify(),
            ErrorClass::NotFound
        );
        assert_eq!(
            SyncError::validation("empty project id").classify(),
            ErrorClass::BadRequest
        );
        assert_eq!(SyncError::write("disk full").classify(), ErrorClass::Internal);
        assert_eq!(
            SyncError::timeout("remote read", 30).classify(),
            ErrorClass::Internal
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(SyncError::read("bad json").is_transient());
        assert!(SyncError::timeout("remote read", 5).is_transient());
        assert!(!SyncError::Auth("denied".into()).is_transient());
        assert!(!SyncError::validation("x").is_transient());
    }

    #[test]
    fn test_payload_serialization() {
        let payload = SyncError::not_found("/tmp/p/.taskmaster/tasks/tasks.json").to_payload();
        assert_eq!(payload.code, "NOT_FOUND");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["class"], "not-found");
        assert!(json["message"]
            .as_str()
            .unwrap()
            .contains(".taskmaster/tasks/tasks.json"));
    }
}
