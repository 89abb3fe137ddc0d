//! Port manager — hands out `(http, raft)` pairs from this node's ranges.
//!
//! Allocation state is local to the node and guarded by one mutex, so an
//! allocate or release is atomic with respect to every other allocation.
//! Before a port is handed out it is probed by binding and immediately
//! releasing a listener, which skips ports held by foreign processes.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::Mutex;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use dbgrid_core::PortRange;

use crate::error::{PortError, PortResult};

/// Upper bound on bind probes per allocation.
const MAX_PROBES: usize = 64;

#[derive(Default)]
struct Allocations {
    http: BTreeSet<u16>,
    raft: BTreeSet<u16>,
}

pub struct PortManager {
    http_range: PortRange,
    raft_range: PortRange,
    /// Host to probe-bind on; `None` skips the probe.
    probe_host: Option<String>,
    allocated: Mutex<Allocations>,
}

impl PortManager {
    pub fn new(http_range: PortRange, raft_range: PortRange) -> Self {
        Self {
            http_range,
            raft_range,
            probe_host: Some("127.0.0.1".to_string()),
            allocated: Mutex::new(Allocations::default()),
        }
    }

    /// Probe on `host` instead of loopback.
    pub fn with_probe_host(mut self, host: impl Into<String>) -> Self {
        self.probe_host = Some(host.into());
        self
    }

    /// Trust the ranges without probing. Used when no real engine binds.
    pub fn without_probe(mut self) -> Self {
        self.probe_host = None;
        self
    }

    /// Reserve a free pair, chosen at random from each range.
    pub fn allocate_pair(&self) -> PortResult<(u16, u16)> {
        let mut allocated = self.allocated.lock().expect("ports lock");

        let http = self.pick(&self.http_range, &allocated.http, None)?;
        let raft = self.pick(&self.raft_range, &allocated.raft, Some(http))?;

        allocated.http.insert(http);
        allocated.raft.insert(raft);
        debug!(http_port = http, raft_port = raft, "port pair allocated");
        Ok((http, raft))
    }

    /// Reserve exactly `(http, raft)`, e.g. the pair a database used
    /// before it hibernated.
    pub fn allocate_specific(&self, http: u16, raft: u16) -> PortResult<()> {
        if !self.http_range.contains(http) {
            return Err(PortError::OutOfRange(http));
        }
        if !self.raft_range.contains(raft) {
            return Err(PortError::OutOfRange(raft));
        }

        let mut allocated = self.allocated.lock().expect("ports lock");
        if allocated.http.contains(&http) {
            return Err(PortError::AlreadyAllocated(http));
        }
        if allocated.raft.contains(&raft) {
            return Err(PortError::AlreadyAllocated(raft));
        }
        for port in [http, raft] {
            if !self.bindable(port) {
                return Err(PortError::Unavailable(port));
            }
        }

        allocated.http.insert(http);
        allocated.raft.insert(raft);
        debug!(http_port = http, raft_port = raft, "specific port pair allocated");
        Ok(())
    }

    /// Return a pair to the pool. Releasing an unallocated pair is a no-op.
    pub fn release(&self, http: u16, raft: u16) {
        let mut allocated = self.allocated.lock().expect("ports lock");
        let freed = allocated.http.remove(&http) | allocated.raft.remove(&raft);
        if freed {
            debug!(http_port = http, raft_port = raft, "port pair released");
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        let allocated = self.allocated.lock().expect("ports lock");
        allocated.http.contains(&port) || allocated.raft.contains(&port)
    }

    pub fn allocated_pairs(&self) -> usize {
        self.allocated.lock().expect("ports lock").http.len()
    }

    fn pick(&self, range: &PortRange, taken: &BTreeSet<u16>, also_skip: Option<u16>) -> PortResult<u16> {
        let mut free: Vec<u16> = range
            .iter()
            .filter(|p| !taken.contains(p) && Some(*p) != also_skip)
            .collect();
        free.shuffle(&mut rand::thread_rng());

        free.into_iter()
            .take(MAX_PROBES)
            .find(|&port| self.bindable(port))
            .ok_or_else(|| {
                warn!(http = %self.http_range, raft = %self.raft_range, "port ranges exhausted");
                PortError::Exhausted {
                    http: self.http_range.to_string(),
                    raft: self.raft_range.to_string(),
                }
            })
    }

    fn bindable(&self, port: u16) -> bool {
        match &self.probe_host {
            Some(host) => TcpListener::bind((host.as_str(), port)).is_ok(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(http: [u16; 2], raft: [u16; 2]) -> PortManager {
        PortManager::new(http.into(), raft.into()).without_probe()
    }

    #[test]
    fn allocates_within_ranges() {
        let ports = manager([5001, 5010], [7001, 7010]);
        let (http, raft) = ports.allocate_pair().unwrap();
        assert!((5001..=5010).contains(&http));
        assert!((7001..=7010).contains(&raft));
        assert!(ports.is_allocated(http));
        assert!(ports.is_allocated(raft));
    }

    #[test]
    fn never_hands_out_a_port_twice() {
        let ports = manager([5001, 5004], [7001, 7004]);
        let mut seen = BTreeSet::new();
        for _ in 0..4 {
            let (http, raft) = ports.allocate_pair().unwrap();
            assert!(seen.insert(http));
            assert!(seen.insert(raft));
        }
        assert!(matches!(ports.allocate_pair(), Err(PortError::Exhausted { .. })));
    }

    #[test]
    fn release_makes_pair_reusable() {
        let ports = manager([5001, 5001], [7001, 7001]);
        let (http, raft) = ports.allocate_pair().unwrap();
        assert!(ports.allocate_pair().is_err());

        ports.release(http, raft);
        ports.release(http, raft);
        assert_eq!(ports.allocate_pair().unwrap(), (5001, 7001));
    }

    #[test]
    fn specific_pair_rules() {
        let ports = manager([5001, 5010], [7001, 7010]);
        assert!(matches!(ports.allocate_specific(4000, 7001), Err(PortError::OutOfRange(4000))));
        assert!(matches!(ports.allocate_specific(5001, 9000), Err(PortError::OutOfRange(9000))));

        ports.allocate_specific(5003, 7003).unwrap();
        assert!(matches!(
            ports.allocate_specific(5003, 7004),
            Err(PortError::AlreadyAllocated(5003))
        ));
        assert_eq!(ports.allocated_pairs(), 1);
    }

    #[test]
    fn overlapping_ranges_never_pair_a_port_with_itself() {
        let ports = manager([6000, 6001], [6000, 6001]);
        let (http, raft) = ports.allocate_pair().unwrap();
        assert_ne!(http, raft);
    }

    #[test]
    fn probe_skips_foreign_listener() {
        let held = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let ports = PortManager::new(PortRange::new(port, port), PortRange::new(1, 1))
            .without_probe()
            .with_probe_host("127.0.0.1");
        assert!(matches!(ports.allocate_specific(port, 1), Err(PortError::Unavailable(p)) if p == port));
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        use std::sync::Arc;

        let ports = Arc::new(manager([5001, 5100], [7001, 7100]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || {
                    (0..10).map(|_| ports.allocate_pair().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut http_ports = BTreeSet::new();
        for h in handles {
            for (http, _) in h.join().unwrap() {
                assert!(http_ports.insert(http));
            }
        }
        assert_eq!(http_ports.len(), 80);
    }
}
