// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use crate::error::Result;

/// The slice of a hypervisor control plane the pinning engine needs.
///
/// Implementations own the connection. Queries report failures as
/// [`Error::Hypervisor`](crate::Error::Hypervisor); a rejected affinity
/// assignment is reported as [`Error::Pinning`](crate::Error::Pinning).
pub trait Hypervisor {
    /// Handle of an active guest domain.
    type Guest;

    /// Total number of hardware threads of the host.
    fn count_host_threads(&self) -> Result<usize>;

    /// Active guests, in whatever order the control plane returns them.
    fn list_active_guests(&self) -> Result<Vec<Self::Guest>>;

    /// Number of vCPUs provisioned for `guest`.
    fn guest_vcpu_count(&self, guest: &Self::Guest) -> Result<usize>;

    /// Stable identity of `guest`, used for ordering and logging.
    fn guest_name(&self, guest: &Self::Guest) -> Result<String>;

    /// Restrict vCPU `vcpu` of `guest` to the threads set in `mask`, a
    /// byte-oriented pin map describing `nr_bits` host threads.
    fn apply_vcpu_affinity(
        &self,
        guest: &Self::Guest,
        vcpu: usize,
        mask: &[u8],
        nr_bits: usize,
    ) -> Result<()>;
}
