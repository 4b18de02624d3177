// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Error types for the pinning engine.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Host topology metadata is missing, unreadable or laid out unexpectedly.
    #[error("Failed to read CPU topology at {path:?}: {reason}")]
    TopologyRead { path: PathBuf, reason: String },

    /// A cpulist string (e.g. "0,24" or "0-3") could not be parsed.
    #[error("Failed to parse cpulist {0:?}")]
    InvalidCpulist(String),

    /// More vCPUs were requested than the host has hardware threads for.
    #[error("Not enough host threads: {requested} vCPU(s) requested, {available} available")]
    Capacity { requested: usize, available: usize },

    /// A thread index does not fit in the declared mask capacity.
    #[error("Thread {thread} does not fit in a {nr_bytes}-byte affinity mask")]
    Encoding { thread: usize, nr_bytes: usize },

    /// The control plane rejected an affinity assignment.
    #[error("Failed to pin vCPU {vcpu} of guest {guest}: {reason}")]
    Pinning {
        guest: String,
        vcpu: usize,
        reason: String,
    },

    /// A query against the hypervisor control plane failed.
    #[error("Hypervisor request failed: {0}")]
    Hypervisor(String),
}

impl Error {
    pub(crate) fn topology(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::TopologyRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Cycle-level errors leave the process running; everything else is
    /// fatal for the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Capacity { .. } | Error::Pinning { .. })
    }
}
