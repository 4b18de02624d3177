// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Allocation of host hardware threads to guest vCPUs.
//!
//! Guests are packed from the top of the Topology downwards. With `H` host
//! threads of which `r` are already reserved, a guest with `k` vCPUs gets the
//! window `[H - r - k, H - r)`, vCPU 0 on the lowest index of the window. The
//! low threads, where the host itself tends to run, are handed out last.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::topology::HardwareThread;
use crate::topology::Topology;

/// How much of its physical core a vCPU is allowed to run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    /// Every hardware thread sharing the core of the assigned thread. The
    /// guest is kept on one core but the host may pick the hyperthread.
    #[default]
    SiblingGroup,
    /// Exactly the assigned hardware thread.
    SingleThread,
}

impl Placement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Placement::SiblingGroup => "sibling-group",
            Placement::SingleThread => "single-thread",
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Placement {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sibling-group" => Ok(Placement::SiblingGroup),
            "single-thread" => Ok(Placement::SingleThread),
            _ => Err(format!(
                "invalid placement '{s}', expected 'sibling-group' or 'single-thread'"
            )),
        }
    }
}

/// One vCPU of a guest and the topology entry it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuAssignment<'a> {
    pub vcpu: usize,
    pub thread: &'a HardwareThread,
    pub placement: Placement,
}

impl VcpuAssignment<'_> {
    /// Index of the assigned entry in the Topology.
    pub fn topo_index(&self) -> usize {
        self.thread.id()
    }

    /// Host threads the vCPU may run on.
    pub fn threads(&self) -> Result<Vec<usize>> {
        match self.placement {
            Placement::SiblingGroup => self.thread.sibling_threads(),
            Placement::SingleThread => Ok(vec![self.thread.id()]),
        }
    }

    /// Threads as written in logs, e.g. "6,30".
    pub fn cpulist(&self) -> String {
        match self.placement {
            Placement::SiblingGroup => self.thread.siblings().to_string(),
            Placement::SingleThread => self.thread.id().to_string(),
        }
    }
}

/// Compute the assignment of a guest's vCPUs given `reserved` threads
/// already handed out in this cycle.
///
/// The caller is expected to have checked that the cycle fits in
/// `host_threads`; a window that does not fit is still refused here instead
/// of being truncated. A guest without vCPUs always gets an empty plan.
pub fn plan_guest(
    topo: &Topology,
    host_threads: usize,
    reserved: usize,
    nr_vcpus: usize,
    placement: Placement,
) -> Result<Vec<VcpuAssignment<'_>>> {
    if nr_vcpus == 0 {
        return Ok(vec![]);
    }

    // The control plane must not report threads the topology doesn't know.
    if host_threads > topo.len() {
        return Err(Error::Capacity {
            requested: host_threads,
            available: topo.len(),
        });
    }

    let requested = reserved.saturating_add(nr_vcpus);
    if requested > host_threads {
        return Err(Error::Capacity {
            requested,
            available: host_threads,
        });
    }

    let end = host_threads - reserved;
    let start = end - nr_vcpus;
    Ok(topo.threads()[start..end]
        .iter()
        .enumerate()
        .map(|(vcpu, thread)| VcpuAssignment {
            vcpu,
            thread,
            placement,
        })
        .collect())
}

/// Running count of host threads handed out during one pinning cycle.
#[derive(Debug)]
pub struct Reservation {
    host_threads: usize,
    reserved: usize,
}

impl Reservation {
    pub fn new(host_threads: usize) -> Reservation {
        Reservation {
            host_threads,
            reserved: 0,
        }
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn remaining(&self) -> usize {
        self.host_threads - self.reserved
    }

    /// Plan the next guest and reserve its window. Nothing is reserved on
    /// error.
    pub fn plan_guest<'a>(
        &mut self,
        topo: &'a Topology,
        nr_vcpus: usize,
        placement: Placement,
    ) -> Result<Vec<VcpuAssignment<'a>>> {
        let plan = plan_guest(topo, self.host_threads, self.reserved, nr_vcpus, placement)?;
        self.reserved += nr_vcpus;
        Ok(plan)
    }
}
