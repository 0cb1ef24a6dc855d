use crate::collectors::ProbeError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{ProcessExt, System, SystemExt};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub run_time_secs: u64,
}

#[derive(Debug)]
struct TableState {
    system: System,
    refreshed_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct ProcessTable {
    process_name: String,
    min_refresh: Duration,
    state: Arc<Mutex<TableState>>,
}

impl ProcessTable {
    pub fn new(process_name: impl Into<String>, min_refresh: Duration) -> Self {
        Self {
            process_name: process_name.into(),
            min_refresh,
            state: Arc::new(Mutex::new(TableState {
                system: System::new(),
                refreshed_at: None,
            })),
        }
    }

    pub async fn sample(&self) -> Result<Option<ProcessSample>, ProbeError> {
        let state = self.state.clone();
        let name = self.process_name.clone();
        let min_refresh = self.min_refresh;

        tokio::task::spawn_blocking(move || {
            let mut guard = state
                .lock()
                .map_err(|_| ProbeError::Unavailable("таблица процессов заблокирована".to_string()))?;
            let stale = guard
                .refreshed_at
                .map_or(true, |at| at.elapsed() >= min_refresh);
            if stale {
                guard.system.refresh_processes();
                guard.system.refresh_memory();
                guard.refreshed_at = Some(Instant::now());
            }
            Ok(find_sample(&guard.system, &name))
        })
        .await?
    }
}

fn find_sample(system: &System, name: &str) -> Option<ProcessSample> {
    // several matches happen while the server restarts; the oldest one is the
    // instance that owns the port
    let process = system
        .processes_by_name(name)
        .max_by_key(|p| p.run_time())?;

    let total = system.total_memory();
    let mem_percent = if total > 0 {
        (process.memory() as f64 / total as f64) * 100.0
    } else {
        0.0
    };

    Some(ProcessSample {
        cpu_percent: process.cpu_usage() as f64,
        mem_percent,
        run_time_secs: process.run_time(),
    })
}
