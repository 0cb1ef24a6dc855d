use crate::collectors::process::ProcessTable;
use crate::collectors::{ProbeError, ServerHost};
use crate::config::ServerConfig;
use crate::state::ResourceUsage;
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ShellHost {
    process_name: String,
    session_name: String,
    port: u16,
    hardcopy: Hardcopy,
    command_timeout: Duration,
    table: ProcessTable,
}

// every caller shares one dump file, so dump and read must not interleave
#[derive(Debug, Clone)]
struct Hardcopy {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Hardcopy {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn capture<F, Fut>(&self, dump: F) -> Result<String, ProbeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ProbeError>>,
    {
        let _guard = self.lock.lock().await;
        dump().await?;
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| ProbeError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[derive(Debug)]
struct CommandOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl ShellHost {
    pub fn new(server: &ServerConfig, command_timeout: Duration) -> Self {
        Self {
            process_name: server.process_name.clone(),
            session_name: server.session_name.clone(),
            port: server.port,
            hardcopy: Hardcopy::new(server.hardcopy_path()),
            command_timeout,
            table: ProcessTable::new(server.process_name.clone(), Duration::from_secs(1)),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ProbeError> {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match time::timeout(self.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ProbeError::Spawn {
                    program: program.to_string(),
                    source,
                })
            }
            Err(_elapsed) => {
                return Err(ProbeError::Timeout {
                    program: program.to_string(),
                    timeout_ms: self.command_timeout.as_millis() as u64,
                })
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn screen(&self, args: &[&str]) -> Result<(), ProbeError> {
        let out = self.run("screen", args).await?;
        if out.code == Some(0) {
            Ok(())
        } else {
            Err(ProbeError::Failed {
                program: "screen".to_string(),
                code: out.code,
                stderr: if out.stderr.is_empty() {
                    out.stdout.trim().to_string()
                } else {
                    out.stderr
                },
            })
        }
    }
}

#[async_trait]
impl ServerHost for ShellHost {
    async fn process_live(&self) -> Result<bool, ProbeError> {
        Ok(self.table.sample().await?.is_some())
    }

    async fn session_live(&self) -> Result<bool, ProbeError> {
        // `screen -ls` exits with 1 even when sessions exist, only stdout matters
        let out = self.run("screen", &["-ls"]).await?;
        Ok(session_is_detached(&out.stdout, &self.session_name))
    }

    async fn port_open(&self) -> Result<bool, ProbeError> {
        let port_arg = format!(":{}", self.port);
        let out = self.run("lsof", &["-nP", "-i", &port_arg]).await?;
        match out.code {
            Some(0) | Some(1) => Ok(port_owned_by(&out.stdout, &self.process_name)),
            code => Err(ProbeError::Failed {
                program: "lsof".to_string(),
                code,
                stderr: out.stderr,
            }),
        }
    }

    async fn resource_usage(&self) -> Result<ResourceUsage, ProbeError> {
        Ok(self
            .table
            .sample()
            .await?
            .map(|s| ResourceUsage::new(s.cpu_percent, s.mem_percent))
            .unwrap_or_default())
    }

    async fn uptime_seconds(&self) -> Result<u64, ProbeError> {
        Ok(self
            .table
            .sample()
            .await?
            .map(|s| s.run_time_secs)
            .unwrap_or(0))
    }

    async fn log_tail(&self, lines: usize) -> Result<String, ProbeError> {
        let path = self.hardcopy.path.display().to_string();
        let args = ["-S", self.session_name.as_str(), "-X", "hardcopy", path.as_str()];
        let text = self.hardcopy.capture(|| self.screen(&args)).await?;
        Ok(tail_lines(&text, lines))
    }

    async fn create_session(&self) -> Result<(), ProbeError> {
        debug!(session = %self.session_name, "creating detached screen session");
        self.screen(&["-dmS", &self.session_name]).await
    }

    async fn send_command(&self, command: &str) -> Result<(), ProbeError> {
        let command = validate_console_command(command)?;
        debug!(session = %self.session_name, command, "sending console command");
        let line = format!("{command}\n");
        self.screen(&["-S", &self.session_name, "-X", "stuff", &line])
            .await
    }
}

fn session_is_detached(screen_ls: &str, session: &str) -> bool {
    screen_ls.lines().any(|line| {
        let Some(id) = line.split_whitespace().next() else {
            return false;
        };
        let named = id
            .split_once('.')
            .map_or(false, |(_pid, name)| name == session);
        named && line.contains("Detached")
    })
}

// lsof cuts COMMAND to 9 characters, so `bedrock_server` shows as `bedrock_s`
const LSOF_COMMAND_WIDTH: usize = 9;

fn port_owned_by(lsof_output: &str, process_name: &str) -> bool {
    let shown = LSOF_COMMAND_WIDTH.min(process_name.len());
    lsof_output
        .lines()
        .filter(|line| !line.starts_with("COMMAND"))
        .filter_map(|line| line.split_whitespace().next())
        .any(|command| command.len() >= shown && process_name.starts_with(command))
}

// screen pads hardcopy output with empty rows up to the window height
pub(crate) fn tail_lines(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let end = all
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map_or(0, |idx| idx + 1);
    let start = end.saturating_sub(lines);
    all[start..end].join("\n")
}

fn validate_console_command(command: &str) -> Result<&str, ProbeError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(ProbeError::Rejected("пустая команда".to_string()));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(ProbeError::Rejected(
            "команда содержит управляющие символы".to_string(),
        ));
    }
    Ok(trimmed)
}
