//! Hands out NBD ports from a fixed inclusive range exclusively to jobs.
//!
//! In-memory and authoritative only while the Hub runs: on restart any
//! in-flight jobs are considered lost (their rows are still `running`);
//! the stale-job detector is responsible for failing them back to a
//! consistent state.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortAllocError {
    #[error("no free NBD ports available in the configured range")]
    NoPortsAvailable,
}

#[derive(Debug, Clone)]
pub struct PortAllocation {
    pub port: u16,
    pub job_id: String,
    pub disk_index: i64,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllocatorMetrics {
    pub allocated: usize,
    pub free: usize,
    pub allocations_served: u64,
    pub releases_served: u64,
}

struct Inner {
    range: RangeInclusive<u16>,
    allocated: BTreeMap<u16, PortAllocation>,
    allocations_served: u64,
    releases_served: u64,
}

/// Pool of `[range.start, range.end]` ports (default 10100..=10200, 101 values).
pub struct NbdPortAllocator {
    inner: RwLock<Inner>,
}

impl NbdPortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                range,
                allocated: BTreeMap::new(),
                allocations_served: 0,
                releases_served: 0,
            }),
        }
    }

    /// Returns the lowest currently-free port in the range.
    pub fn allocate(&self, job_id: &str, disk_index: i64) -> Result<u16, PortAllocError> {
        let mut inner = self.inner.write();
        let range = inner.range.clone();
        let port = range
            .into_iter()
            .find(|p| !inner.allocated.contains_key(p))
            .ok_or(PortAllocError::NoPortsAvailable)?;

        inner.allocated.insert(
            port,
            PortAllocation {
                port,
                job_id: job_id.to_string(),
                disk_index,
                allocated_at: Utc::now(),
            },
        );
        inner.allocations_served += 1;
        Ok(port)
    }

    /// Idempotent: releasing a port that isn't held is a no-op.
    pub fn release(&self, port: u16) {
        let mut inner = self.inner.write();
        if inner.allocated.remove(&port).is_some() {
            inner.releases_served += 1;
        }
    }

    /// Releases every port held by `job_id`. Called unconditionally at
    /// job teardown, successful or not.
    pub fn release_by_job_id(&self, job_id: &str) {
        let mut inner = self.inner.write();
        let ports: Vec<u16> = inner
            .allocated
            .values()
            .filter(|a| a.job_id == job_id)
            .map(|a| a.port)
            .collect();
        for port in ports {
            inner.allocated.remove(&port);
            inner.releases_served += 1;
        }
    }

    pub fn job_ports(&self, job_id: &str) -> Vec<PortAllocation> {
        self.inner
            .read()
            .allocated
            .values()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn metrics(&self) -> AllocatorMetrics {
        let inner = self.inner.read();
        let total = inner.range.clone().count();
        AllocatorMetrics {
            allocated: inner.allocated.len(),
            free: total.saturating_sub(inner.allocated.len()),
            allocations_served: inner.allocations_served,
            releases_served: inner.releases_served,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_port_first() {
        let allocator = NbdPortAllocator::new(10100..=10101);
        assert_eq!(allocator.allocate("job-1", 0).unwrap(), 10100);
        assert_eq!(allocator.allocate("job-1", 1).unwrap(), 10101);
    }

    #[test]
    fn full_range_of_101_ports_then_exhausted() {
        let allocator = NbdPortAllocator::new(10100..=10200);
        for i in 0..101 {
            allocator.allocate("job-1", i).unwrap();
        }
        assert!(matches!(
            allocator.allocate("job-1", 999),
            Err(PortAllocError::NoPortsAvailable)
        ));
    }

    #[test]
    fn release_is_idempotent() {
        let allocator = NbdPortAllocator::new(10100..=10100);
        let port = allocator.allocate("job-1", 0).unwrap();
        allocator.release(port);
        allocator.release(port);
        assert_eq!(allocator.metrics().allocated, 0);
    }

    #[test]
    fn release_by_job_id_frees_only_that_jobs_ports() {
        let allocator = NbdPortAllocator::new(10100..=10105);
        allocator.allocate("job-1", 0).unwrap();
        allocator.allocate("job-1", 1).unwrap();
        allocator.allocate("job-2", 0).unwrap();

        allocator.release_by_job_id("job-1");

        assert_eq!(allocator.job_ports("job-1").len(), 0);
        assert_eq!(allocator.job_ports("job-2").len(), 1);
        assert_eq!(allocator.metrics().allocated, 1);
    }

    #[test]
    fn no_port_is_ever_double_allocated() {
        let allocator = NbdPortAllocator::new(10100..=10100);
        allocator.allocate("job-1", 0).unwrap();
        assert!(allocator.allocate("job-2", 0).is_err());
    }
}
