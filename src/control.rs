use crate::collectors::{ProbeError, ServerHost};
use crate::config::{ControlConfig, QuickCommand};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    Start,
    Stop,
    Restart,
}

impl ServerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }

    pub fn done_message(self) -> &'static str {
        match self {
            Self::Start => "Server started",
            Self::Stop => "Server stopped",
            Self::Restart => "Server restarted",
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("сервер уже запущен")]
    AlreadyRunning,
    #[error("консоль сервера не ответила за {timeout_ms} мс")]
    Timeout { timeout_ms: u64 },
    #[error(transparent)]
    Host(#[from] ProbeError),
}

#[derive(Clone)]
pub struct ServerController {
    host: Arc<dyn ServerHost>,
    cfg: ControlConfig,
    timeout: Duration,
}

impl ServerController {
    pub fn new(host: Arc<dyn ServerHost>, cfg: ControlConfig, timeout: Duration) -> Self {
        Self { host, cfg, timeout }
    }

    pub fn quick_commands(&self) -> &[QuickCommand] {
        &self.cfg.quick_commands
    }

    pub fn default_log_lines(&self) -> usize {
        self.cfg.log_lines
    }

    pub fn refresh_delay(&self, action: ServerAction) -> Duration {
        match action {
            ServerAction::Start => Duration::ZERO,
            ServerAction::Stop => Duration::from_millis(self.cfg.stop_refresh_delay_ms),
            ServerAction::Restart => Duration::from_millis(self.cfg.restart_refresh_delay_ms),
        }
    }

    pub async fn logs(&self, lines: usize) -> Result<String, ControlError> {
        self.bounded(self.host.log_tail(lines)).await
    }

    pub async fn start(&self) -> Result<(), ControlError> {
        if !self.bounded(self.host.session_live()).await? {
            info!("console session missing, creating it");
            self.bounded(self.host.create_session()).await?;
            time::sleep(Duration::from_millis(self.cfg.session_settle_ms)).await;
        }
        self.launch().await
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        self.bounded(self.host.send_command(&self.cfg.stop_command))
            .await
    }

    pub async fn restart(&self) -> Result<(), ControlError> {
        self.stop().await?;
        time::sleep(Duration::from_millis(self.cfg.restart_delay_ms)).await;
        self.launch().await
    }

    async fn launch(&self) -> Result<(), ControlError> {
        self.bounded(self.host.send_command(&self.cfg.launch_command))
            .await
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, ProbeError>>,
    ) -> Result<T, ControlError> {
        match time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_elapsed) => Err(ControlError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}
