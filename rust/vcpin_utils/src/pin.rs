// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! One pinning cycle: check that every active guest fits on the host, then
//! walk the guests in name order, reserving a window of the Topology for each
//! and pinning each vCPU to the threads of its window entry.

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::alloc::Placement;
use crate::alloc::Reservation;
use crate::alloc::VcpuAssignment;
use crate::cpumask::build_mask;
use crate::cpumask::mask_len;
use crate::error::Error;
use crate::error::Result;
use crate::hypervisor::Hypervisor;
use crate::topology::Topology;

/// An active guest along with what the cycle needs to know about it.
#[derive(Debug, Clone)]
pub struct GuestInfo<G> {
    pub guest: G,
    pub name: String,
    pub nr_vcpus: usize,
}

/// A vCPU the control plane refused to pin.
#[derive(Debug)]
pub struct PinFailure {
    pub guest: String,
    pub vcpu: usize,
    pub error: Error,
}

/// A guest that vanished or could not be queried while listing guests.
#[derive(Debug, Clone)]
pub struct SkippedGuest {
    pub guest: String,
    pub reason: String,
}

/// Active guests in name order, plus the ones that could not be queried.
#[derive(Debug)]
pub struct GuestList<G> {
    pub guests: Vec<GuestInfo<G>>,
    pub skipped: Vec<SkippedGuest>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub nr_guests: usize,
    pub nr_pinned: usize,
    pub failures: Vec<PinFailure>,
    pub skipped: Vec<SkippedGuest>,
}

impl CycleReport {
    /// Every vCPU of every listed guest got pinned.
    pub fn success(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }
}

/// Query every active guest and return them sorted by name, so that the
/// same set of guests always lands on the same threads.
///
/// Only a failure to list the guests is an error. A guest whose own queries
/// fail, typically because it stopped after being listed, is skipped.
pub fn collect_guests<H: Hypervisor>(hv: &H) -> Result<GuestList<H::Guest>> {
    let mut list = GuestList {
        guests: Vec::new(),
        skipped: Vec::new(),
    };

    for (idx, guest) in hv.list_active_guests()?.into_iter().enumerate() {
        let name = match hv.guest_name(&guest) {
            Ok(name) => name,
            Err(error) => {
                let name = format!("domain #{idx}");
                warn!(name = %name, %error, "Failed to get domain name, skipping");
                list.skipped.push(SkippedGuest {
                    guest: name,
                    reason: error.to_string(),
                });
                continue;
            }
        };
        let nr_vcpus = match hv.guest_vcpu_count(&guest) {
            Ok(nr_vcpus) => nr_vcpus,
            Err(error) => {
                warn!(name = %name, %error, "Failed to get domain vCPU count, skipping");
                list.skipped.push(SkippedGuest {
                    guest: name,
                    reason: error.to_string(),
                });
                continue;
            }
        };
        list.guests.push(GuestInfo {
            guest,
            name,
            nr_vcpus,
        });
    }
    list.guests.sort_by(|a, b| a.name.cmp(&b.name));

    info!(
        count = list.guests.len(),
        skipped = list.skipped.len(),
        "Domains found"
    );
    Ok(list)
}

/// Run one pinning cycle over `list`.
///
/// Fails with [`Error::Capacity`] without touching any guest when the guests
/// need more vCPUs than `host_threads`. Otherwise every vCPU is attempted;
/// the ones the control plane refused are listed in the report, next to the
/// guests skipped while listing.
pub fn run_cycle<H: Hypervisor>(
    hv: &H,
    list: &GuestList<H::Guest>,
    host_threads: usize,
    topo: &Topology,
    placement: Placement,
) -> Result<CycleReport> {
    let guests = &list.guests;
    let requested: usize = guests.iter().map(|g| g.nr_vcpus).sum();
    if requested > host_threads {
        info!(
            requested,
            available = host_threads,
            "Not enough CPU(s) to apply pinning on all provisioned domains. Skipping"
        );
        return Err(Error::Capacity {
            requested,
            available: host_threads,
        });
    }
    info!(requested, available = host_threads, "Enough CPUs to apply pinning on provisioned vCPUs");

    let nr_bits = host_threads.max(topo.nr_thread_ids());
    let nr_bytes = mask_len(nr_bits);
    let mut resv = Reservation::new(host_threads);
    let mut report = CycleReport {
        skipped: list.skipped.clone(),
        ..Default::default()
    };

    for g in guests.iter() {
        info!(name = %g.name, vcpus = g.nr_vcpus, "Working on domain");
        let plan = resv.plan_guest(topo, g.nr_vcpus, placement)?;

        for assignment in plan.iter() {
            match pin_vcpu(hv, g, assignment, nr_bytes, nr_bits) {
                Ok(()) => report.nr_pinned += 1,
                Err(error) => {
                    warn!(name = %g.name, vcpu = assignment.vcpu, %error, "Failed to pin vCPU");
                    report.failures.push(PinFailure {
                        guest: g.name.clone(),
                        vcpu: assignment.vcpu,
                        error,
                    });
                }
            }
        }
        report.nr_guests += 1;
    }

    debug!(
        reserved = resv.reserved(),
        remaining = resv.remaining(),
        "Reservation after cycle"
    );
    Ok(report)
}

fn pin_vcpu<H: Hypervisor>(
    hv: &H,
    g: &GuestInfo<H::Guest>,
    assignment: &VcpuAssignment<'_>,
    nr_bytes: usize,
    nr_bits: usize,
) -> Result<()> {
    let mask = build_mask(assignment.threads()?, nr_bytes)?;
    info!(
        name = %g.name,
        vcpu = assignment.vcpu,
        threads = %assignment.cpulist(),
        cpu = assignment.topo_index(),
        "Pinning vCPU on threads"
    );
    debug!(mask = %mask, nr_bits, "Affinity mask");

    hv.apply_vcpu_affinity(&g.guest, assignment.vcpu, mask.as_bytes(), nr_bits)
}
