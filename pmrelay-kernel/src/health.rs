use crate::store::{Store, StoreError};
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub hosts_tracked: u32,
    pub hosts_online: u32,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, store: &Store) -> Result<KernelHealth, StoreError> {
        let (tracked, online) = store.host_counts()?;
        Ok(KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            hosts_tracked: tracked,
            hosts_online: online,
            memory_usage_mb: get_memory_usage_mb(),
        })
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            if let Some(mb) = parse_vm_rss_mb(&status) {
                return mb;
            }
        }
    }
    // pas de /proc : valeur inconnue
    0.0
}

fn parse_vm_rss_mb(status: &str) -> Option<f32> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb as f32 / 1024.0) // KB -> MB
}
