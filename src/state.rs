use crate::collectors::ProbeReadings;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub mem_percent: f64,
}

impl ResourceUsage {
    pub fn new(cpu_percent: f64, mem_percent: f64) -> Self {
        Self {
            cpu_percent: non_negative(cpu_percent),
            mem_percent: non_negative(mem_percent),
        }
    }
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    reachable: bool,
    process_live: bool,
    session_live: bool,
    port_open: bool,
    occupants: Vec<String>,
    capacity: u32,
    uptime_seconds: u64,
    resource: ResourceUsage,
    taken_at: SystemTime,
}

impl StatusSnapshot {
    pub fn new(readings: ProbeReadings, capacity: u32, taken_at: SystemTime) -> Self {
        let mut occupants: Vec<String> = Vec::with_capacity(readings.occupants.len());
        for name in readings.occupants {
            if !occupants.contains(&name) {
                occupants.push(name);
            }
        }

        Self {
            reachable: readings.process_live && readings.port_open,
            process_live: readings.process_live,
            session_live: readings.session_live,
            port_open: readings.port_open,
            occupants,
            capacity,
            uptime_seconds: readings.uptime_seconds,
            resource: ResourceUsage::new(
                readings.resource.cpu_percent,
                readings.resource.mem_percent,
            ),
            taken_at: truncate_to_millis(taken_at),
        }
    }

    pub fn offline(capacity: u32, taken_at: SystemTime) -> Self {
        Self::new(ProbeReadings::default(), capacity, taken_at)
    }

    pub fn reachable(&self) -> bool {
        self.reachable
    }

    pub fn process_live(&self) -> bool {
        self.process_live
    }

    pub fn session_live(&self) -> bool {
        self.session_live
    }

    pub fn port_open(&self) -> bool {
        self.port_open
    }

    pub fn occupants(&self) -> &[String] {
        &self.occupants
    }

    pub fn occupant_count(&self) -> usize {
        self.occupants.len()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.uptime_seconds
    }

    pub fn resource(&self) -> ResourceUsage {
        self.resource
    }

    pub fn taken_at(&self) -> SystemTime {
        self.taken_at
    }
}

pub fn truncate_to_millis(ts: SystemTime) -> SystemTime {
    match ts.duration_since(UNIX_EPOCH) {
        Ok(d) => UNIX_EPOCH + Duration::from_millis(d.as_millis() as u64),
        Err(_) => UNIX_EPOCH,
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotCache {
    slot: Arc<RwLock<Arc<StatusSnapshot>>>,
}

impl SnapshotCache {
    pub fn new(capacity: u32) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Arc::new(StatusSnapshot::offline(
                capacity,
                SystemTime::now(),
            )))),
        }
    }

    pub async fn read(&self) -> Arc<StatusSnapshot> {
        self.slot.read().await.clone()
    }

    pub async fn write(&self, snapshot: Arc<StatusSnapshot>) -> Arc<StatusSnapshot> {
        let mut guard = self.slot.write().await;
        std::mem::replace(&mut *guard, snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings(process_live: bool, port_open: bool) -> ProbeReadings {
        ProbeReadings {
            process_live,
            session_live: true,
            port_open,
            resource: ResourceUsage::new(12.5, 3.25),
            uptime_seconds: 42,
            occupants: vec!["Steve".to_string(), "Alex".to_string()],
        }
    }

    #[test]
    fn reachable_requires_process_and_port() {
        let now = SystemTime::now();
        assert!(StatusSnapshot::new(readings(true, true), 10, now).reachable());
        assert!(!StatusSnapshot::new(readings(false, true), 10, now).reachable());
        assert!(!StatusSnapshot::new(readings(false, false), 10, now).reachable());

        let half_up = StatusSnapshot::new(readings(true, false), 10, now);
        assert!(!half_up.reachable());
        assert_eq!(half_up.occupant_count(), 2);
        assert_eq!(half_up.uptime_seconds(), 42);
    }

    #[test]
    fn duplicate_occupants_collapse_in_order() {
        let mut r = readings(true, true);
        r.occupants = vec![
            "Steve".to_string(),
            "Alex".to_string(),
            "Steve".to_string(),
        ];
        let snapshot = StatusSnapshot::new(r, 10, SystemTime::now());
        assert_eq!(snapshot.occupants(), ["Steve", "Alex"]);
        assert_eq!(snapshot.occupant_count(), snapshot.occupants().len());
    }

    #[test]
    fn resource_is_clamped_to_non_negative() {
        let usage = ResourceUsage::new(-1.0, f64::NAN);
        assert_eq!(usage, ResourceUsage::new(0.0, 0.0));
    }

    #[test]
    fn taken_at_is_truncated_to_millis() {
        let ts = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let snapshot = StatusSnapshot::offline(10, ts);
        assert_eq!(
            snapshot.taken_at(),
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_123)
        );
    }

    #[tokio::test]
    async fn cache_starts_offline_and_replaces_on_write() {
        let cache = SnapshotCache::new(7);
        let initial = cache.read().await;
        assert!(!initial.reachable());
        assert!(!initial.process_live());
        assert_eq!(initial.capacity(), 7);
        assert!(initial.occupants().is_empty());

        let fresh = Arc::new(StatusSnapshot::new(readings(true, true), 7, SystemTime::now()));
        let previous = cache.write(fresh.clone()).await;
        assert!(!previous.reachable());

        let current = cache.read().await;
        assert!(Arc::ptr_eq(&current, &fresh));
        assert!(!initial.reachable());
    }
}
