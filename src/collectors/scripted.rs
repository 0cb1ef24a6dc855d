use crate::collectors::shell::tail_lines;
use crate::collectors::{ProbeError, ServerHost};
use crate::state::ResourceUsage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// `None` makes the probe fail
#[derive(Debug, Clone, Default)]
pub struct HostScript {
    pub process_live: Option<bool>,
    pub session_live: Option<bool>,
    pub port_open: Option<bool>,
    pub resource: Option<ResourceUsage>,
    pub uptime_seconds: Option<u64>,
    pub log: Option<String>,
    pub log_delay: Option<Duration>,
    pub reject_commands: bool,
}

#[derive(Debug, Default)]
pub struct ScriptedHost {
    script: Mutex<HostScript>,
    cycles: AtomicUsize,
    log_reads: AtomicUsize,
    sessions_created: AtomicUsize,
    commands: Mutex<Vec<String>>,
}

impl ScriptedHost {
    pub fn new(script: HostScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Self::default()
        })
    }

    pub fn up(log: &str) -> Arc<Self> {
        Self::new(HostScript {
            process_live: Some(true),
            session_live: Some(true),
            port_open: Some(true),
            resource: Some(ResourceUsage::new(12.5, 4.75)),
            uptime_seconds: Some(3600),
            log: Some(log.to_string()),
            ..HostScript::default()
        })
    }

    pub fn set(&self, f: impl FnOnce(&mut HostScript)) {
        f(&mut self.script.lock().unwrap());
    }

    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn log_reads(&self) -> usize {
        self.log_reads.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn script(&self) -> HostScript {
        self.script.lock().unwrap().clone()
    }
}

fn scripted<T>(value: Option<T>, probe: &str) -> Result<T, ProbeError> {
    value.ok_or_else(|| ProbeError::Unavailable(format!("{probe} не задан")))
}

#[async_trait]
impl ServerHost for ScriptedHost {
    async fn process_live(&self) -> Result<bool, ProbeError> {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        scripted(self.script().process_live, "process")
    }

    async fn session_live(&self) -> Result<bool, ProbeError> {
        scripted(self.script().session_live, "session")
    }

    async fn port_open(&self) -> Result<bool, ProbeError> {
        scripted(self.script().port_open, "port")
    }

    async fn resource_usage(&self) -> Result<ResourceUsage, ProbeError> {
        scripted(self.script().resource, "resource")
    }

    async fn uptime_seconds(&self) -> Result<u64, ProbeError> {
        scripted(self.script().uptime_seconds, "uptime")
    }

    async fn log_tail(&self, lines: usize) -> Result<String, ProbeError> {
        self.log_reads.fetch_add(1, Ordering::SeqCst);
        let script = self.script();
        if let Some(delay) = script.log_delay {
            tokio::time::sleep(delay).await;
        }
        scripted(script.log, "log").map(|log| tail_lines(&log, lines))
    }

    async fn send_command(&self, command: &str) -> Result<(), ProbeError> {
        if self.script().reject_commands {
            return Err(ProbeError::Rejected(command.to_string()));
        }
        self.commands.lock().unwrap().push(command.to_string());
        Ok(())
    }

    async fn create_session(&self) -> Result<(), ProbeError> {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().session_live = Some(true);
        Ok(())
    }
}
