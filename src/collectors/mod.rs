pub mod aggregator;
pub mod occupancy;
pub mod process;
pub mod shell;

#[cfg(test)]
pub mod scripted;

use crate::state::ResourceUsage;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Default)]
pub struct ProbeReadings {
    pub process_live: bool,
    pub session_live: bool,
    pub port_open: bool,
    pub resource: ResourceUsage,
    pub uptime_seconds: u64,
    pub occupants: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("не удалось запустить {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} завершился с кодом {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{program} не ответил за {timeout_ms} мс")]
    Timeout { program: String, timeout_ms: u64 },
    #[error("не удалось прочитать {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("проба недоступна: {0}")]
    Unavailable(String),
    #[error("команда отклонена: {0}")]
    Rejected(String),
    #[error("фоновая задача пробы завершилась с ошибкой: {0}")]
    Join(#[from] tokio::task::JoinError),
}

// Absence (no process, no session, port not bound) is `Ok(false)`, not an error.
#[async_trait]
pub trait ServerHost: Send + Sync {
    async fn process_live(&self) -> Result<bool, ProbeError>;

    async fn session_live(&self) -> Result<bool, ProbeError>;

    async fn port_open(&self) -> Result<bool, ProbeError>;

    async fn resource_usage(&self) -> Result<ResourceUsage, ProbeError>;

    async fn uptime_seconds(&self) -> Result<u64, ProbeError>;

    async fn log_tail(&self, lines: usize) -> Result<String, ProbeError>;

    async fn send_command(&self, command: &str) -> Result<(), ProbeError>;

    async fn create_session(&self) -> Result<(), ProbeError>;
}
