use std::collections::HashMap;
use std::time::Duration;

use warden_security::ResourceLimits;

/// Heap caps derived from a single memory cap: a quarter goes to the young
/// generation, the rest to the old generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLimits {
    pub young_generation_mb: u64,
    pub old_generation_mb: u64,
}

impl HeapLimits {
    pub fn split(max_memory_mb: u64) -> Self {
        let young = max_memory_mb / 4;
        Self {
            young_generation_mb: young,
            old_generation_mb: max_memory_mb - young,
        }
    }
}

pub fn heap_limits(limits: &ResourceLimits) -> Option<HeapLimits> {
    limits.max_memory_mb.map(HeapLimits::split)
}

/// Environment variables through which the runner learns its caps.
pub fn resource_env(limits: &ResourceLimits) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(heap) = heap_limits(limits) {
        env.insert(
            "WARDEN_MAX_YOUNG_GEN_MB".to_string(),
            heap.young_generation_mb.to_string(),
        );
        env.insert(
            "WARDEN_MAX_OLD_GEN_MB".to_string(),
            heap.old_generation_mb.to_string(),
        );
    }

    let caps = [
        ("WARDEN_MAX_MEMORY_MB", limits.max_memory_mb),
        ("WARDEN_MAX_CPU_PERCENT", limits.max_cpu_percent.map(u64::from)),
        ("WARDEN_MAX_NETWORK_BPS", limits.max_network_bytes_per_sec),
        ("WARDEN_MAX_FILE_HANDLES", limits.max_file_handles),
        ("WARDEN_MAX_EXECUTION_TIME_MS", limits.max_execution_time_ms),
    ];
    for (key, value) in caps {
        if let Some(value) = value {
            env.insert(key.to_string(), value.to_string());
        }
    }
    env
}

/// A call never waits longer than the worker's execution-time cap.
pub fn effective_call_timeout(requested: Duration, limits: Option<&ResourceLimits>) -> Duration {
    match limits.and_then(|l| l.max_execution_time_ms) {
        Some(cap) => requested.min(Duration::from_millis(cap)),
        None => requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_cap_splits_quarter_young() {
        assert_eq!(
            HeapLimits::split(128),
            HeapLimits {
                young_generation_mb: 32,
                old_generation_mb: 96
            }
        );
        let odd = HeapLimits::split(10);
        assert_eq!(odd.young_generation_mb + odd.old_generation_mb, 10);
    }

    #[test]
    fn absent_memory_cap_means_no_heap_limits() {
        assert!(heap_limits(&ResourceLimits::default()).is_none());
        assert!(resource_env(&ResourceLimits::default()).is_empty());
    }

    #[test]
    fn resource_env_carries_every_cap() {
        let limits = ResourceLimits {
            max_memory_mb: Some(256),
            max_cpu_percent: Some(50),
            max_network_bytes_per_sec: None,
            max_file_handles: Some(64),
            max_execution_time_ms: Some(2_000),
        };
        let env = resource_env(&limits);
        assert_eq!(env["WARDEN_MAX_YOUNG_GEN_MB"], "64");
        assert_eq!(env["WARDEN_MAX_OLD_GEN_MB"], "192");
        assert_eq!(env["WARDEN_MAX_CPU_PERCENT"], "50");
        assert_eq!(env["WARDEN_MAX_FILE_HANDLES"], "64");
        assert_eq!(env["WARDEN_MAX_EXECUTION_TIME_MS"], "2000");
        assert!(!env.contains_key("WARDEN_MAX_NETWORK_BPS"));
    }

    #[test]
    fn execution_cap_clamps_call_timeout() {
        let limits = ResourceLimits {
            max_execution_time_ms: Some(500),
            ..Default::default()
        };
        assert_eq!(
            effective_call_timeout(Duration::from_secs(30), Some(&limits)),
            Duration::from_millis(500)
        );
        assert_eq!(
            effective_call_timeout(Duration::from_millis(100), Some(&limits)),
            Duration::from_millis(100)
        );
        assert_eq!(
            effective_call_timeout(Duration::from_secs(30), None),
            Duration::from_secs(30)
        );
    }
}
