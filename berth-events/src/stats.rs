//! Docker-compatible stats derivation from the metric stream.
//!
//! Docker clients compute a CPU percentage from deltas between two
//! consecutive entries:
//!
//! ```text
//! cpu% = (cpu_delta / system_delta) * online_cpus * 100
//! ```
//!
//! The hypervisor reports absolute Mhz usage per sample, not cumulative
//! ticks, so the converter fabricates cumulative-looking numbers whose
//! deltas come out right: the current total is `current + previous` so
//! the delta is exactly the current sample, and the system counter is
//! doubled so the system delta is exactly the host's total Mhz.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metrics::VmMetrics;

/// Errors from feeding samples into a [`StatsConverter`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StatsError {
    /// The sample's timestamp is strictly before the previous one.
    #[error("sample at {current} is older than previous sample at {previous}")]
    InvalidOrder {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuUsageStats {
    pub total_usage: i64,
    pub percpu_usage: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuStats {
    pub cpu_usage: CpuUsageStats,
    pub system_cpu_usage: i64,
    pub online_cpus: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub usage: i64,
    pub limit: u64,
}

/// One docker stats entry, ready to serialize onto a stats stream.
#[derive(Debug, Clone, Serialize)]
pub struct StatsEntry {
    pub read: DateTime<Utc>,
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
    pub memory_stats: MemoryStats,
}

/// Stateful converter from [`VmMetrics`] samples to [`StatsEntry`].
///
/// One instance per stats stream; it remembers the previous sample.
pub struct StatsConverter {
    prev: Option<VmMetrics>,
    /// Total Mhz available to the host, the denominator docker's
    /// percentage formula ends up using.
    vch_mhz: i64,
    mem_limit_bytes: u64,
}

impl StatsConverter {
    #[must_use]
    pub fn new(vch_mhz: i64, mem_limit_mb: u64) -> Self {
        Self {
            prev: None,
            vch_mhz,
            mem_limit_bytes: mem_limit_mb * 1024 * 1024,
        }
    }

    /// Feeds one sample. The first sample primes the converter and yields
    /// nothing; a sample with the same timestamp as the previous is
    /// dropped.
    ///
    /// # Errors
    /// [`StatsError::InvalidOrder`] when the sample's timestamp moves
    /// backwards.
    pub fn update(&mut self, metrics: VmMetrics) -> Result<Option<StatsEntry>, StatsError> {
        let Some(prev) = &self.prev else {
            self.prev = Some(metrics);
            return Ok(None);
        };

        if metrics.sampled_at == prev.sampled_at {
            return Ok(None);
        }
        if metrics.sampled_at < prev.sampled_at {
            return Err(StatsError::InvalidOrder {
                previous: prev.sampled_at,
                current: metrics.sampled_at,
            });
        }

        let current_total = metrics.average_mhz();
        let previous_total = prev.average_mhz();

        let entry = StatsEntry {
            read: metrics.sampled_at,
            cpu_stats: CpuStats {
                cpu_usage: CpuUsageStats {
                    total_usage: current_total + previous_total,
                    percpu_usage: metrics.cpus.iter().map(|c| c.mhz).collect(),
                },
                system_cpu_usage: 2 * self.vch_mhz,
                online_cpus: metrics.cpus.len() as u32,
            },
            precpu_stats: CpuStats {
                cpu_usage: CpuUsageStats {
                    total_usage: previous_total,
                    percpu_usage: prev.cpus.iter().map(|c| c.mhz).collect(),
                },
                system_cpu_usage: self.vch_mhz,
                online_cpus: prev.cpus.len() as u32,
            },
            memory_stats: MemoryStats {
                usage: metrics.active_memory_bytes,
                limit: self.mem_limit_bytes,
            },
        };
        self.prev = Some(metrics);
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CpuUsage;
    use berth_core::VmRef;
    use chrono::TimeDelta;

    fn sample(at: DateTime<Utc>, mhz: &[i64], active_bytes: i64) -> VmMetrics {
        VmMetrics {
            vm: VmRef::from("vm-1".to_owned()),
            cpus: mhz
                .iter()
                .enumerate()
                .map(|(id, &mhz)| CpuUsage { id: id as i32, mhz })
                .collect(),
            active_memory_bytes: active_bytes,
            sampled_at: at,
            interval_secs: 20,
        }
    }

    #[test]
    fn first_sample_yields_nothing() {
        let mut conv = StatsConverter::new(4000, 512);
        let out = conv.update(sample(Utc::now(), &[100], 0)).expect("update");
        assert!(out.is_none());
    }

    #[test]
    fn deltas_recover_current_sample_and_host_mhz() {
        let mut conv = StatsConverter::new(4000, 512);
        let t0 = Utc::now();
        conv.update(sample(t0, &[100, 300], 0)).expect("prime");
        let entry = conv
            .update(sample(t0 + TimeDelta::seconds(20), &[200, 400], 0))
            .expect("update")
            .expect("entry");

        // prev average = 200, current average = 300.
        let cpu_delta =
            entry.cpu_stats.cpu_usage.total_usage - entry.precpu_stats.cpu_usage.total_usage;
        assert_eq!(cpu_delta, 300, "cpu delta must equal the current sample");
        let system_delta = entry.cpu_stats.system_cpu_usage - entry.precpu_stats.system_cpu_usage;
        assert_eq!(system_delta, 4000, "system delta must equal host Mhz");
        assert_eq!(entry.cpu_stats.online_cpus, 2);
    }

    #[test]
    fn memory_fields_carry_limit_and_usage() {
        let mut conv = StatsConverter::new(4000, 512);
        let t0 = Utc::now();
        conv.update(sample(t0, &[100], 0)).expect("prime");
        let entry = conv
            .update(sample(t0 + TimeDelta::seconds(20), &[100], 4096 * 1024))
            .expect("update")
            .expect("entry");
        assert_eq!(entry.memory_stats.limit, 512 * 1024 * 1024);
        assert_eq!(entry.memory_stats.usage, 4096 * 1024);
    }

    #[test]
    fn duplicate_timestamp_is_dropped() {
        let mut conv = StatsConverter::new(4000, 512);
        let t0 = Utc::now();
        conv.update(sample(t0, &[100], 0)).expect("prime");
        let out = conv.update(sample(t0, &[999], 0)).expect("update");
        assert!(out.is_none());
        // The previous sample is unchanged: the next delta is against t0.
        let entry = conv
            .update(sample(t0 + TimeDelta::seconds(20), &[200], 0))
            .expect("update")
            .expect("entry");
        assert_eq!(entry.precpu_stats.cpu_usage.total_usage, 100);
    }

    #[test]
    fn backwards_timestamp_is_invalid_order() {
        let mut conv = StatsConverter::new(4000, 512);
        let t0 = Utc::now();
        conv.update(sample(t0, &[100], 0)).expect("prime");
        let result = conv.update(sample(t0 - TimeDelta::seconds(5), &[100], 0));
        assert!(matches!(result, Err(StatsError::InvalidOrder { .. })));
    }

    #[test]
    fn consecutive_entries_chain_previous_totals() {
        let mut conv = StatsConverter::new(4000, 512);
        let t0 = Utc::now();
        conv.update(sample(t0, &[100], 0)).expect("prime");
        let first = conv
            .update(sample(t0 + TimeDelta::seconds(20), &[200], 0))
            .expect("update")
            .expect("entry");
        assert_eq!(first.cpu_stats.cpu_usage.total_usage, 300);
        let second = conv
            .update(sample(t0 + TimeDelta::seconds(40), &[400], 0))
            .expect("update")
            .expect("entry");
        assert_eq!(second.precpu_stats.cpu_usage.total_usage, 200);
        assert_eq!(second.cpu_stats.cpu_usage.total_usage, 600);
    }
}
