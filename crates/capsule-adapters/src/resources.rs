//! Hardware governor backed by `sysinfo`.
//!
//! Free resource is the host's available memory. The system is unsafe when CPU usage
//! reaches the hard ceiling or free memory drops below the floor; between the soft
//! threshold and the ceiling the throttle factor falls linearly.

use capsule_core::{ResourceProvider, ResourceSnapshot};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSettings {
    pub min_free_mb: u64,
    /// Percent; at or above this the system is unsafe.
    pub cpu_hard_ceiling: f32,
    /// Percent; throttling starts above this.
    pub cpu_soft_threshold: f32,
    pub min_throttle: f32,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            min_free_mb: 2_048,
            cpu_hard_ceiling: 95.0,
            cpu_soft_threshold: 70.0,
            min_throttle: 0.25,
        }
    }
}

/// Pure verdict from raw readings.
pub fn governor_verdict(available_bytes: u64, cpu_usage: f32, settings: &GovernorSettings) -> ResourceSnapshot {
    let free_mb = available_bytes / (1024 * 1024);
    let cpu = if cpu_usage.is_finite() { cpu_usage.clamp(0.0, 100.0) } else { 100.0 };
    let is_safe = cpu < settings.cpu_hard_ceiling && free_mb >= settings.min_free_mb;
    let throttle = if cpu <= settings.cpu_soft_threshold {
        1.0
    } else {
        let span = (settings.cpu_hard_ceiling - settings.cpu_soft_threshold).max(f32::EPSILON);
        let progress = ((cpu - settings.cpu_soft_threshold) / span).clamp(0.0, 1.0);
        1.0 - progress * (1.0 - settings.min_throttle)
    };
    ResourceSnapshot::new(free_mb, is_safe, throttle.clamp(settings.min_throttle, 1.0))
}

pub struct SysinfoResourceProvider {
    sys: Mutex<System>,
    settings: GovernorSettings,
}

impl SysinfoResourceProvider {
    pub fn new(settings: GovernorSettings) -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self {
            sys: Mutex::new(sys),
            settings,
        }
    }
}

impl Default for SysinfoResourceProvider {
    fn default() -> Self {
        Self::new(GovernorSettings::default())
    }
}

#[async_trait::async_trait]
impl ResourceProvider for SysinfoResourceProvider {
    async fn snapshot(&self) -> ResourceSnapshot {
        let (available, cpu) = {
            let mut sys = self.sys.lock().await;
            sys.refresh_cpu();
            sys.refresh_memory();
            (sys.available_memory(), sys.global_cpu_info().cpu_usage())
        };
        let snapshot = governor_verdict(available, cpu, &self.settings);
        tracing::debug!(
            target: "capsule::adapters::resources",
            free_mb = snapshot.free_resource_mb,
            cpu,
            safe = snapshot.is_safe,
            throttle = snapshot.throttle_factor,
            "Resource snapshot"
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn idle_host_is_safe_and_unthrottled() {
        let s = governor_verdict(16 * GB, 10.0, &GovernorSettings::default());
        assert_eq!(s.free_resource_mb, 16 * 1024);
        assert!(s.is_safe);
        assert_eq!(s.throttle_factor, 1.0);
    }

    #[test]
    fn busy_cpu_throttles_then_unsafe() {
        let settings = GovernorSettings::default();
        let mid = governor_verdict(16 * GB, 82.5, &settings);
        assert!(mid.is_safe);
        assert!((mid.throttle_factor - 0.625).abs() < 1e-4);

        let pegged = governor_verdict(16 * GB, 99.0, &settings);
        assert!(!pegged.is_safe);
        assert_eq!(pegged.throttle_factor, settings.min_throttle);
    }

    #[test]
    fn low_memory_is_unsafe() {
        assert!(!governor_verdict(GB, 5.0, &GovernorSettings::default()).is_safe);
        assert!(!governor_verdict(16 * GB, f32::NAN, &GovernorSettings::default()).is_safe);
    }

    #[tokio::test]
    async fn live_snapshot_reports_memory() {
        let provider = SysinfoResourceProvider::default();
        let s = provider.snapshot().await;
        assert!(s.throttle_factor > 0.0 && s.throttle_factor <= 1.0);
    }
}
