//! SSH 远程读取器
//!
//! 通过 `RemoteShell` 建立会话，先 `test -f` 检查存在性，再 `cat` 读取。
//! 整个读取过程受 `remote_read_timeout` 约束，会话在所有退出路径上都会显式关闭。
//!
//! 默认实现 `OpenSshShell` 使用系统 `ssh` 客户端：一个 ControlMaster 主连接
//! 承载认证，后续命令通过控制套接字复用；密码认证经 `sshpass -e` 传递，
//! 密码只出现在子进程环境变量中。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::format::parse_document;
use super::{relative_tasks_path, ProjectDescriptor, SourceKind, SourceReader};
use crate::error::{SyncError, SyncResult};
use crate::models::TaskCollection;

/// 远程主机连接参数
#[derive(Clone, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub password: Option<String>,
    /// 远程项目根目录
    pub remote_root: String,
}

fn default_ssh_port() -> u16 {
    22
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key", &self.private_key)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("remote_root", &self.remote_root)
            .finish()
    }
}

impl SshTarget {
    /// 私钥与密码必须且只能配置其一
    pub fn validate_credentials(&self) -> SyncResult<()> {
        let has_key = self
            .private_key
            .as_ref()
            .map_or(false, |p| !p.as_os_str().is_empty());
        let has_password = self.password.as_deref().map_or(false, |p| !p.is_empty());
        match (has_key, has_password) {
            (false, false) => Err(SyncError::Auth(format!(
                "{}@{} 未配置 SSH 私钥或密码",
                self.username, self.host
            ))),
            (true, true) => Err(SyncError::validation(
                "SSH 私钥与密码不能同时配置",
            )),
            _ => Ok(()),
        }
    }

    /// 远程任务文件路径
    pub fn remote_tasks_path(&self, tag: Option<&str>) -> String {
        let root = self.remote_root.trim_end_matches('/');
        let rel = relative_tasks_path(tag);
        let rel = rel.to_string_lossy();
        if root.is_empty() {
            rel.into_owned()
        } else {
            format!("{}/{}", root, rel)
        }
    }
}

/// 远程命令输出
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// 远程 shell 传输
#[async_trait::async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> SyncResult<Box<dyn RemoteSession>>;
}

/// 已建立的远程会话
#[async_trait::async_trait]
pub trait RemoteSession: Send {
    async fn exec(&mut self, command: &str) -> SyncResult<CommandOutput>;

    /// 关闭会话；重复调用应是无害的
    async fn close(&mut self) -> SyncResult<()>;
}

/// 单引号转义，供远程 shell 使用
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// SSH 读取器
pub struct SshReader {
    shell: Arc<dyn RemoteShell>,
    timeout: Duration,
}

impl SshReader {
    pub fn new(shell: Arc<dyn RemoteShell>, timeout: Duration) -> Self {
        Self { shell, timeout }
    }

    async fn read_remote(session: &mut dyn RemoteSession, path: &str) -> SyncResult<TaskCollection> {
        let quoted = shell_quote(path);

        let probe = session.exec(&format!("test -f {}", quoted)).await?;
        match probe.exit_code {
            0 => {}
            1 => {
                return Err(SyncError::not_found(format!(
                    "远程任务文件不存在: {}",
                    path
                )))
            }
            code => return Err(classify_exit(code, &probe.stderr, "检查远程任务文件")),
        }

        let output = session.exec(&format!("cat {}", quoted)).await?;
        if output.exit_code != 0 {
            return Err(classify_exit(output.exit_code, &output.stderr, "读取远程任务文件"));
        }
        let parsed = parse_document(&output.stdout)?;
        debug!(
            "[SshSource] 读取远程任务文件 {}: {} 个任务",
            path,
            parsed.collection.total_tasks()
        );
        Ok(parsed.collection)
    }
}

#[async_trait::async_trait]
impl SourceReader for SshReader {
    fn kind(&self) -> SourceKind {
        SourceKind::Ssh
    }

    async fn read(
        &self,
        project: &ProjectDescriptor,
        _user_id: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<TaskCollection> {
        let target = project.remote.as_ref().ok_or_else(|| {
            SyncError::validation(format!("项目 {} 未配置 SSH 远程", project.project_id))
        })?;
        target.validate_credentials()?;
        let path = target.remote_tasks_path(project.tag.as_deref());
        let deadline = Instant::now() + self.timeout;
        let seconds = self.timeout.as_secs();

        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled("远程读取已取消".into())),
            res = tokio::time::timeout_at(deadline, self.shell.connect(target)) => match res {
                Ok(session) => session?,
                Err(_) => return Err(SyncError::timeout(format!("连接 {}", target.host), seconds)),
            },
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled("远程读取已取消".into())),
            res = tokio::time::timeout_at(deadline, Self::read_remote(session.as_mut(), &path)) => {
                res.unwrap_or_else(|_| Err(SyncError::timeout(format!("读取 {}", path), seconds)))
            }
        };

        if let Err(e) = session.close().await {
            warn!("[SshSource] 关闭 SSH 会话失败: {}", e);
        }
        result
    }
}

/// 将 ssh 退出码映射到错误分类
///
/// 255 是 ssh 自身的错误（连接/认证），其余为远程命令的退出码。
fn classify_exit(code: i32, stderr: &str, action: &str) -> SyncError {
    let lower = stderr.to_lowercase();
    if code == 255 {
        if lower.contains("permission denied")
            || lower.contains("authentication failed")
            || lower.contains("host key verification failed")
        {
            return SyncError::Auth(format!("{}: {}", action, stderr.trim()));
        }
        return SyncError::read(format!("{}: SSH 连接失败: {}", action, stderr.trim()));
    }
    SyncError::read(format!("{}: 退出码 {}: {}", action, code, stderr.trim()))
}

/// 基于系统 ssh 客户端的传输
#[derive(Debug, Clone)]
pub struct OpenSshShell {
    pub connect_timeout: Duration,
    /// `false` 时使用 `accept-new`，仅接受首次见到的主机
    pub strict_host_key_checking: bool,
    /// 控制套接字所在目录
    pub control_dir: PathBuf,
}

impl Default for OpenSshShell {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            strict_host_key_checking: true,
            control_dir: std::env::temp_dir(),
        }
    }
}

impl OpenSshShell {
    fn base_options(&self, target: &SshTarget, socket: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            target.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                if self.strict_host_key_checking {
                    "yes"
                } else {
                    "accept-new"
                }
            ),
            "-o".to_string(),
            format!("ControlPath={}", socket),
        ];
        if let Some(key) = &target.private_key {
            args.extend([
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
                "-i".to_string(),
                key.to_string_lossy().into_owned(),
            ]);
        } else {
            args.extend([
                "-o".to_string(),
                "BatchMode=no".to_string(),
                "-o".to_string(),
                "PreferredAuthentications=password,keyboard-interactive".to_string(),
                "-o".to_string(),
                "PubkeyAuthentication=no".to_string(),
            ]);
        }
        args
    }

    fn master_command(&self, target: &SshTarget, socket: &str) -> Command {
        let mut cmd = match &target.password {
            Some(password) if target.private_key.is_none() => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            _ => Command::new("ssh"),
        };
        cmd.args(self.base_options(target, socket))
            .args(["-M", "-N", "-o", "ControlMaster=yes"])
            .arg(format!("{}@{}", target.username, target.host))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl RemoteShell for OpenSshShell {
    async fn connect(&self, target: &SshTarget) -> SyncResult<Box<dyn RemoteSession>> {
        target.validate_credentials()?;
        let socket = self
            .control_dir
            .join(format!("task-sync-{}.sock", Uuid::new_v4().simple()))
            .to_string_lossy()
            .into_owned();

        let mut master = self.master_command(target, &socket).spawn().map_err(|e| {
            SyncError::read(format!("无法启动 ssh 客户端: {}", e))
        })?;

        let deadline = Instant::now() + self.connect_timeout + Duration::from_secs(1);
        loop {
            if let Some(status) = master.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                let action = format!("连接 {}@{}", target.username, target.host);
                // sshpass: 5 = 密码错误, 6 = 主机密钥未知
                return Err(match status.code() {
                    Some(5) | Some(6) if target.private_key.is_none() => {
                        SyncError::Auth(format!("{}: {}", action, stderr.trim()))
                    }
                    code => classify_exit(code.unwrap_or(255), &stderr, &action),
                });
            }
            if std::path::Path::new(&socket).exists() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = master.kill().await;
                return Err(SyncError::timeout(
                    format!("连接 {}", target.host),
                    self.connect_timeout.as_secs(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!(
            "[SshSource] 已建立 SSH 主连接: {}@{}:{}",
            target.username, target.host, target.port
        );
        Ok(Box::new(OpenSshSession {
            target: target.clone(),
            socket,
            master: Some(master),
        }))
    }
}

struct OpenSshSession {
    target: SshTarget,
    socket: String,
    master: Option<Child>,
}

impl OpenSshSession {
    fn control_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(["-S", self.socket.as_str(), "-o", "ControlMaster=no", "-o", "BatchMode=yes"])
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg(format!("{}@{}", self.target.username, self.target.host))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl RemoteSession for OpenSshSession {
    async fn exec(&mut self, command: &str) -> SyncResult<CommandOutput> {
        if self.master.is_none() {
            return Err(SyncError::read("SSH 会话已关闭"));
        }
        let output = self
            .control_command()
            .arg("--")
            .arg(command)
            .output()
            .await
            .map_err(|e| SyncError::read(format!("执行远程命令失败: {}", e)))?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(255),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn close(&mut self) -> SyncResult<()> {
        let Some(mut master) = self.master.take() else {
            return Ok(());
        };
        let exit = self
            .control_command()
            .args(["-O", "exit"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if !matches!(exit, Ok(status) if status.success()) {
            debug!("[SshSource] 控制命令退出失败，直接终止主连接");
            let _ = master.kill().await;
        }
        let _ = master.wait().await;
        let _ = std::fs::remove_file(&self.socket);
        debug!("[SshSource] SSH 会话已关闭: {}", self.target.host);
        Ok(())
    }
}
