//! Simulation of libvirt's display port allocator
//!
//! libvirt hands out SPICE ports by walking its display range upwards and
//! taking the first port it has not already reserved and that nothing else
//! on the host is bound to. [`PortAllocator`] replays that walk so the
//! expected ports can be computed before the domain is started.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::address::{IpAddress, ListenProbe};
use crate::error::AllocationError;

/// Default start of libvirt's `remote_display_port_min`
pub const DEFAULT_PORT_MIN: u16 = 5900;
/// Default end of libvirt's `remote_display_port_max`
pub const DEFAULT_PORT_MAX: u16 = 65535;

/// Per-scenario port allocator.
///
/// The claimed set lives in the instance; create one allocator per scenario.
#[derive(Debug)]
pub struct PortAllocator<P> {
    claimed: BTreeSet<u16>,
    min: u16,
    max: u16,
    candidates: Vec<IpAddress>,
    probe: P,
}

impl<P: ListenProbe> PortAllocator<P> {
    /// Allocator over the inclusive range `[min, max]`, treating a port as
    /// busy when any of `candidates` is listening on it
    pub fn new(min: u16, max: u16, candidates: Vec<IpAddress>, probe: P) -> Self {
        Self {
            claimed: BTreeSet::new(),
            min,
            max,
            candidates,
            probe,
        }
    }

    /// Claim the lowest free port
    pub fn allocate(&mut self) -> Result<u16, AllocationError> {
        let mut port = u32::from(self.min);
        while let Ok(candidate) = u16::try_from(port) {
            if candidate > self.max {
                break;
            }
            if self.claimed.contains(&candidate) {
                trace!("Port {candidate} already claimed");
            } else if let Some(busy) = self
                .candidates
                .iter()
                .find(|addr| self.probe.listening_on(addr, candidate))
            {
                trace!("Port {candidate} in use on {busy}");
            } else {
                self.claimed.insert(candidate);
                debug!("Allocated port {candidate}");
                return Ok(candidate);
            }
            port += 1;
        }
        Err(AllocationError::Overflow {
            port,
            max: self.max,
        })
    }

    /// Mark a port configured explicitly as taken.
    ///
    /// Ports outside the range are ignored since [`PortAllocator::allocate`]
    /// never reaches them. Returns whether the port was newly claimed.
    pub fn reserve(&mut self, port: u16) -> bool {
        if port < self.min || port > self.max {
            return false;
        }
        let fresh = self.claimed.insert(port);
        if fresh {
            debug!("Reserved configured port {port}");
        }
        fresh
    }

    /// Ports handed out so far
    pub fn claimed(&self) -> &BTreeSet<u16> {
        &self.claimed
    }

    /// The inclusive range searched
    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }
}
