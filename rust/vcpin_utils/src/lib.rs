// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Topology-aware vCPU pinning
//!
//! This crate pins the vCPUs of running virtual machines to the hardware
//! threads of a hypervisor host. Each vCPU is given one physical core of the
//! host, and may run on every hyperthread of that core, which keeps guest
//! scheduling local to a core's caches and keeps guests from contending with
//! each other.
//!
//! The pieces, leaf-first:
//!
//! - [`Topology`] reads the host's logical CPUs and their thread siblings from
//!   sysfs.
//! - [`build_mask`] encodes a set of threads into the byte-oriented pin map
//!   the hypervisor expects.
//! - [`plan_guest`] and [`Reservation`] carve a contiguous window of the
//!   Topology out for each guest, top-down.
//! - [`run_cycle`] checks capacity and drives the above over all guests
//!   through a [`Hypervisor`] implementation.

mod alloc;
pub use alloc::plan_guest;
pub use alloc::Placement;
pub use alloc::Reservation;
pub use alloc::VcpuAssignment;

mod cpumask;
pub use cpumask::build_mask;
pub use cpumask::mask_len;
pub use cpumask::read_cpulist;
pub use cpumask::AffinityMask;
pub use cpumask::MAX_THREAD_ID;

mod error;
pub use error::Error;
pub use error::Result;

mod hypervisor;
pub use hypervisor::Hypervisor;

mod pin;
pub use pin::collect_guests;
pub use pin::run_cycle;
pub use pin::CycleReport;
pub use pin::GuestInfo;
pub use pin::GuestList;
pub use pin::PinFailure;
pub use pin::SkippedGuest;

mod topology;
pub use topology::HardwareThread;
pub use topology::Topology;
pub use topology::SYSFS_CPU_ROOT;
