use crate::collectors::occupancy::{self, EventPatterns};
use crate::collectors::{ProbeError, ProbeReadings, ServerHost};
use crate::config::{ConfigError, ProbeConfig};
use crate::metrics::Metrics;
use crate::state::StatusSnapshot;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time;
use tracing::debug;

#[derive(Clone)]
pub struct ProbeAggregator {
    host: Arc<dyn ServerHost>,
    cfg: ProbeConfig,
    patterns: EventPatterns,
    capacity: u32,
    metrics: Arc<Metrics>,
}

impl ProbeAggregator {
    pub fn new(
        host: Arc<dyn ServerHost>,
        cfg: ProbeConfig,
        capacity: u32,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ConfigError> {
        let patterns = cfg.event_patterns()?;
        Ok(Self {
            host,
            cfg,
            patterns,
            capacity,
            metrics,
        })
    }

    pub fn host(&self) -> &Arc<dyn ServerHost> {
        &self.host
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.timeout_ms)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    // a probe that errors or times out contributes its neutral value
    pub async fn probe(&self) -> StatusSnapshot {
        let host = self.host.as_ref();
        let (process_live, session_live, port_open, resource, uptime, log) = tokio::join!(
            self.guarded("process", host.process_live()),
            self.guarded("session", host.session_live()),
            self.guarded("port", host.port_open()),
            self.guarded("resource", host.resource_usage()),
            self.guarded("uptime", host.uptime_seconds()),
            self.guarded("occupancy", host.log_tail(self.cfg.occupancy_tail_lines)),
        );

        let process_live = process_live.unwrap_or(false);
        let occupants = match log {
            Some(log) if process_live => {
                occupancy::occupants(&self.patterns.scan(&log), self.cfg.occupancy_mode)
            }
            _ => Vec::new(),
        };

        let readings = ProbeReadings {
            process_live,
            session_live: session_live.unwrap_or(false),
            port_open: port_open.unwrap_or(false),
            resource: resource.unwrap_or_default(),
            uptime_seconds: if process_live { uptime.unwrap_or(0) } else { 0 },
            occupants,
        };

        let snapshot = StatusSnapshot::new(readings, self.capacity, SystemTime::now());
        self.metrics.update_from_snapshot(&snapshot);
        snapshot
    }

    pub async fn guarded<T>(
        &self,
        probe: &'static str,
        fut: impl Future<Output = Result<T, ProbeError>>,
    ) -> Option<T> {
        match time::timeout(self.timeout(), fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                debug!(probe, error = %err, "probe unavailable");
                self.metrics.inc_probe_unavailable(probe);
                None
            }
            Err(_elapsed) => {
                debug!(probe, timeout_ms = self.cfg.timeout_ms, "probe timed out");
                self.metrics.inc_probe_unavailable(probe);
                None
            }
        }
    }
}
