// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Affinity masks
//!
//! An AffinityMask is a BitVec of u8's with one bit per host hardware thread,
//! laid out the way the hypervisor control plane expects a vCPU pin map:
//! bit 0 of byte 0 is thread 0, bit 7 of byte 0 is thread 7, bit 0 of byte 1
//! is thread 8 and so on.
//!
//! Masks have a fixed byte length chosen by the caller, normally
//! [`mask_len`] of the host thread count. Setting a thread that does not fit
//! in that length is an error rather than a silent grow:
//!
//!```
//!     use vcpin_utils::build_mask;
//!     let mask = build_mask([6, 30], 4).unwrap();
//!     assert_eq!(mask.as_bytes(), &[0x40, 0x00, 0x00, 0x40]);
//!     assert_eq!(mask.to_cpulist(), "6,30");
//!     assert!(build_mask([32], 4).is_err());
//!```

use std::fmt;

use bitvec::prelude::*;
use sscanf::sscanf;

use crate::error::Error;
use crate::error::Result;

/// Thread ids at or above this are refused when parsing a cpulist. Far
/// beyond any kernel's NR_CPUS, low enough to keep masks small.
pub const MAX_THREAD_ID: usize = 1 << 16;

/// Number of bytes needed to hold a mask of `nr_bits` threads.
pub fn mask_len(nr_bits: usize) -> usize {
    nr_bits.div_ceil(8)
}

/// Build a fresh mask of `nr_bytes` bytes with exactly `threads` set.
pub fn build_mask<I>(threads: I, nr_bytes: usize) -> Result<AffinityMask>
where
    I: IntoIterator<Item = usize>,
{
    let mut mask = AffinityMask::new(nr_bytes);
    for thread in threads {
        mask.set_thread(thread)?;
    }
    Ok(mask)
}

#[derive(Debug, Eq, Clone, Hash, PartialEq)]
pub struct AffinityMask {
    mask: BitVec<u8, Lsb0>,
}

impl AffinityMask {
    /// Build an empty mask of `nr_bytes` bytes.
    pub fn new(nr_bytes: usize) -> AffinityMask {
        AffinityMask {
            mask: bitvec![u8, Lsb0; 0; nr_bytes * 8],
        }
    }

    /// Wrap a raw pin map, e.g. one handed to a hypervisor backend.
    pub fn from_bytes(bytes: &[u8]) -> AffinityMask {
        AffinityMask {
            mask: BitVec::from_slice(bytes),
        }
    }

    pub fn nr_bytes(&self) -> usize {
        self.mask.as_raw_slice().len()
    }

    /// Number of threads the mask can describe.
    pub fn nr_bits(&self) -> usize {
        self.mask.len()
    }

    /// Set a thread bit. Other bits are left untouched, so a whole sibling
    /// group can be OR-ed into the same mask.
    pub fn set_thread(&mut self, thread: usize) -> Result<()> {
        if thread / 8 >= self.nr_bytes() {
            return Err(Error::Encoding {
                thread,
                nr_bytes: self.nr_bytes(),
            });
        }
        self.mask.set(thread, true);
        Ok(())
    }

    /// Test whether a thread bit is set. Threads beyond the mask are never
    /// set.
    pub fn test_thread(&self, thread: usize) -> bool {
        self.mask.get(thread).map(|bit| *bit).unwrap_or(false)
    }

    /// Count the number of threads set in the mask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// Raw bytes of the mask, lowest threads first.
    pub fn as_bytes(&self) -> &[u8] {
        self.mask.as_raw_slice()
    }

    /// Iterate over the indices of the threads set in the mask.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }

    /// Render the set threads as a kernel style cpulist, collapsing runs into
    /// ranges ("0-3,8").
    pub fn to_cpulist(&self) -> String {
        let mut groups: Vec<String> = Vec::new();
        let mut run: Option<(usize, usize)> = None;

        for thread in self.iter() {
            run = match run {
                Some((first, last)) if last + 1 == thread => Some((first, thread)),
                Some(prev) => {
                    groups.push(fmt_range(prev));
                    Some((thread, thread))
                }
                None => Some((thread, thread)),
            };
        }
        if let Some(prev) = run {
            groups.push(fmt_range(prev));
        }

        groups.join(",")
    }
}

fn fmt_range((first, last): (usize, usize)) -> String {
    if first == last {
        first.to_string()
    } else {
        format!("{first}-{last}")
    }
}

/// Parse a kernel style cpulist ("0,24", "0-3,8-11" or "5") into the listed
/// thread indices, in the order they appear.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0');
    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => return Err(Error::InvalidCpulist(cpulist.trim().to_string())),
            },
        };
        if min > max || max >= MAX_THREAD_ID {
            return Err(Error::InvalidCpulist(cpulist.trim().to_string()));
        }
        cpu_ids.extend(min..=max);
    }

    Ok(cpu_ids)
}

impl fmt::Display for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(self, f)
    }
}

/// Highest byte first, the way masks are usually written down.
impl fmt::LowerHex for AffinityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = self.as_bytes().to_vec();
        bytes.reverse();
        write!(f, "{}", hex::encode(bytes))
    }
}
