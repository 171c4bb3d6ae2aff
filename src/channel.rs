//! Remote command channel: the only thing the transfer protocol needs from a
//! transport is "run this text, give me stdout/stderr/status back".

use crate::error::ChannelError;
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A short-lived shell on the remote host. Released when dropped.
#[async_trait]
pub trait RemoteShell: Send {
    async fn run_command(&mut self, command: &str) -> Result<CommandOutput, ChannelError>;
}

/// Something that can hand out shells on one remote host.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    async fn open_shell(&self) -> Result<Box<dyn RemoteShell>, ChannelError>;
}

/// Open a shell, giving up after `limit`.
pub async fn open_shell_within<H>(host: &H, limit: Duration) -> Result<Box<dyn RemoteShell>, ChannelError>
where
    H: RemoteHost + ?Sized,
{
    match timeout(limit, host.open_shell()).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::ConnectTimeout(limit)),
    }
}

/// Run one command, giving up after `limit`.
pub async fn run_within(
    shell: &mut dyn RemoteShell,
    command: &str,
    limit: Duration,
) -> Result<CommandOutput, ChannelError> {
    match timeout(limit, shell.run_command(command)).await {
        Ok(result) => result,
        Err(_) => Err(ChannelError::OperationTimeout(limit)),
    }
}

/// Runs every command through a local launcher program, passing the command
/// text as its final argument: `sh -c <cmd>`, `ssh host <cmd>`, ...
#[derive(Debug, Clone)]
pub struct ProcessHost {
    launcher: Vec<String>,
}

impl ProcessHost {
    pub fn new<I, S>(launcher: I) -> Result<Self, ChannelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let launcher: Vec<String> = launcher.into_iter().map(Into::into).collect();
        if launcher.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(ChannelError::Connection("empty launcher command".into()));
        }
        Ok(Self { launcher })
    }

    /// `sh -c` on this machine
    pub fn local_sh() -> Self {
        Self {
            launcher: vec!["sh".into(), "-c".into()],
        }
    }

    pub fn launcher(&self) -> &[String] {
        &self.launcher
    }
}

#[async_trait]
impl RemoteHost for ProcessHost {
    async fn open_shell(&self) -> Result<Box<dyn RemoteShell>, ChannelError> {
        Ok(Box::new(ProcessShell {
            launcher: self.launcher.clone(),
        }))
    }
}

struct ProcessShell {
    launcher: Vec<String>,
}

#[async_trait]
impl RemoteShell for ProcessShell {
    async fn run_command(&mut self, command: &str) -> Result<CommandOutput, ChannelError> {
        let (program, args) = self
            .launcher
            .split_first()
            .ok_or_else(|| ChannelError::Connection("empty launcher command".into()))?;

        // kill_on_drop: a cancelled or timed-out future takes the child with it
        let output = Command::new(program)
            .args(args)
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    ChannelError::Connection(format!("couldn't start {program}: {e}"))
                }
                _ => ChannelError::Transient(format!("{program}: {e}")),
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
