use crate::registry::Population;
use crate::state::StatusSnapshot;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub pulse_server_reachable: Gauge,
    pub pulse_server_process_live: Gauge,
    pub pulse_server_session_live: Gauge,
    pub pulse_server_port_open: Gauge,
    pub pulse_server_occupants: Gauge,
    pub pulse_server_capacity: Gauge,
    pub pulse_server_uptime_seconds: Gauge,
    pub pulse_server_cpu_percent: Gauge,
    pub pulse_server_mem_percent: Gauge,
    pub pulse_last_probe_timestamp_seconds: Gauge,
    pub pulse_subscribers: GaugeVec,
    pub pulse_probe_cycles_total: Counter,
    pub pulse_probe_unavailable_total: CounterVec,
    pub pulse_messages_sent_total: CounterVec,
    pub pulse_delivery_failures_total: Counter,
    pub pulse_inbound_ignored_total: Counter,
    pub pulse_uptime_seconds: Gauge,
    pub pulse_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let pulse_server_reachable = Gauge::with_opts(opts!(
            "pulse_server_reachable",
            "1 when the server process is live and its port is bound"
        ))?;
        let pulse_server_process_live = Gauge::with_opts(opts!(
            "pulse_server_process_live",
            "1 when the server process is present in the process table"
        ))?;
        let pulse_server_session_live = Gauge::with_opts(opts!(
            "pulse_server_session_live",
            "1 when the console session is detached and alive"
        ))?;
        let pulse_server_port_open = Gauge::with_opts(opts!(
            "pulse_server_port_open",
            "1 when the server owns its configured port"
        ))?;
        let pulse_server_occupants = Gauge::with_opts(opts!(
            "pulse_server_occupants",
            "Players currently considered connected"
        ))?;
        let pulse_server_capacity =
            Gauge::with_opts(opts!("pulse_server_capacity", "Configured player capacity"))?;
        let pulse_server_uptime_seconds = Gauge::with_opts(opts!(
            "pulse_server_uptime_seconds",
            "Elapsed run time of the server process"
        ))?;
        let pulse_server_cpu_percent = Gauge::with_opts(opts!(
            "pulse_server_cpu_percent",
            "CPU usage of the server process in percent"
        ))?;
        let pulse_server_mem_percent = Gauge::with_opts(opts!(
            "pulse_server_mem_percent",
            "Memory usage of the server process in percent of total RAM"
        ))?;
        let pulse_last_probe_timestamp_seconds = Gauge::with_opts(opts!(
            "pulse_last_probe_timestamp_seconds",
            "Unix time of the last completed probe cycle"
        ))?;
        let pulse_subscribers = GaugeVec::new(
            opts!("pulse_subscribers", "Connected push subscribers by class"),
            &["class"],
        )?;
        let pulse_probe_cycles_total = Counter::with_opts(opts!(
            "pulse_probe_cycles_total",
            "Completed probe cycles"
        ))?;
        let pulse_probe_unavailable_total = CounterVec::new(
            opts!(
                "pulse_probe_unavailable_total",
                "Sub-probes that failed or timed out and fell back to their default"
            ),
            &["probe"],
        )?;
        let pulse_messages_sent_total = CounterVec::new(
            opts!(
                "pulse_messages_sent_total",
                "Messages queued to subscribers by message type"
            ),
            &["type"],
        )?;
        let pulse_delivery_failures_total = Counter::with_opts(opts!(
            "pulse_delivery_failures_total",
            "Messages dropped because a subscriber queue was full or closed"
        ))?;
        let pulse_inbound_ignored_total = Counter::with_opts(opts!(
            "pulse_inbound_ignored_total",
            "Inbound subscriber messages ignored as malformed or unknown"
        ))?;
        let pulse_uptime_seconds =
            Gauge::with_opts(opts!("pulse_uptime_seconds", "Daemon uptime in seconds"))?;
        let pulse_scrape_count_total = Counter::with_opts(opts!(
            "pulse_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &pulse_server_reachable)?;
        register(&registry, &pulse_server_process_live)?;
        register(&registry, &pulse_server_session_live)?;
        register(&registry, &pulse_server_port_open)?;
        register(&registry, &pulse_server_occupants)?;
        register(&registry, &pulse_server_capacity)?;
        register(&registry, &pulse_server_uptime_seconds)?;
        register(&registry, &pulse_server_cpu_percent)?;
        register(&registry, &pulse_server_mem_percent)?;
        register(&registry, &pulse_last_probe_timestamp_seconds)?;
        register(&registry, &pulse_subscribers)?;
        register(&registry, &pulse_probe_cycles_total)?;
        register(&registry, &pulse_probe_unavailable_total)?;
        register(&registry, &pulse_messages_sent_total)?;
        register(&registry, &pulse_delivery_failures_total)?;
        register(&registry, &pulse_inbound_ignored_total)?;
        register(&registry, &pulse_uptime_seconds)?;
        register(&registry, &pulse_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            pulse_server_reachable,
            pulse_server_process_live,
            pulse_server_session_live,
            pulse_server_port_open,
            pulse_server_occupants,
            pulse_server_capacity,
            pulse_server_uptime_seconds,
            pulse_server_cpu_percent,
            pulse_server_mem_percent,
            pulse_last_probe_timestamp_seconds,
            pulse_subscribers,
            pulse_probe_cycles_total,
            pulse_probe_unavailable_total,
            pulse_messages_sent_total,
            pulse_delivery_failures_total,
            pulse_inbound_ignored_total,
            pulse_uptime_seconds,
            pulse_scrape_count_total,
        }))
    }

    pub fn update_from_snapshot(&self, snapshot: &StatusSnapshot) {
        self.pulse_probe_cycles_total.inc();
        self.pulse_server_reachable
            .set(bool_gauge(snapshot.reachable()));
        self.pulse_server_process_live
            .set(bool_gauge(snapshot.process_live()));
        self.pulse_server_session_live
            .set(bool_gauge(snapshot.session_live()));
        self.pulse_server_port_open
            .set(bool_gauge(snapshot.port_open()));
        self.pulse_server_occupants
            .set(snapshot.occupant_count() as f64);
        self.pulse_server_capacity.set(snapshot.capacity() as f64);
        self.pulse_server_uptime_seconds
            .set(snapshot.uptime_seconds() as f64);
        self.pulse_server_cpu_percent
            .set(snapshot.resource().cpu_percent);
        self.pulse_server_mem_percent
            .set(snapshot.resource().mem_percent);
        let taken_at = snapshot
            .taken_at()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.pulse_last_probe_timestamp_seconds.set(taken_at);
    }

    pub fn update_population(&self, population: Population) {
        self.pulse_subscribers
            .with_label_values(&["standard"])
            .set(population.standard as f64);
        self.pulse_subscribers
            .with_label_values(&["privileged"])
            .set(population.privileged as f64);
    }

    pub fn inc_probe_unavailable(&self, probe: &str) {
        self.pulse_probe_unavailable_total
            .with_label_values(&[probe])
            .inc();
    }

    pub fn add_messages_sent(&self, message_type: &str, count: u64) {
        self.pulse_messages_sent_total
            .with_label_values(&[message_type])
            .inc_by(count as f64);
    }

    pub fn inc_delivery_failure(&self) {
        self.pulse_delivery_failures_total.inc();
    }

    pub fn inc_inbound_ignored(&self) {
        self.pulse_inbound_ignored_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.pulse_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.pulse_uptime_seconds
            .set(now_unix().saturating_sub(self.started_at_unix) as f64);
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn bool_gauge(v: bool) -> f64 {
    if v {
        1.0
    } else {
        0.0
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
