// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Host thread topology
//!
//! A Topology is the flat, ordered list of the host's hardware threads
//! (logical CPUs) as exposed by sysfs. Each HardwareThread carries the raw
//! thread sibling list of its physical core, i.e. the other hyperthreads it
//! shares execution resources with:
//!
//!```text
//!     [ cpu0  0  "0,24" ]
//!     [ cpu1  1  "1,25" ]
//!     ...
//!     [ cpu23 23 "23,47" ]
//!     [ cpu24 24 "0,24" ]
//!     ...
//!```
//!
//! Creating Topology
//! -----------------
//!
//!```no_run
//!     use vcpin_utils::Topology;
//!     let topo = Topology::new().unwrap();
//!     for thread in topo.threads() {
//!         println!("{} -> {}", thread.name(), thread.siblings());
//!     }
//!```
//!
//! The Topology is read-only. It is rebuilt for every pinning cycle so that
//! host reconfiguration (e.g. hotplug) is picked up.

use std::path::Path;

use glob::glob;
use sscanf::sscanf;
use tracing::debug;

use crate::cpumask::read_cpulist;
use crate::error::Error;
use crate::error::Result;

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareThread {
    name: String,
    id: usize,
    siblings: String,
}

impl HardwareThread {
    pub fn new(name: &str, id: usize, siblings: &str) -> HardwareThread {
        HardwareThread {
            name: name.to_string(),
            id,
            siblings: siblings.trim().to_string(),
        }
    }

    /// Get the sysfs name of this thread, e.g. "cpu12"
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the logical index of this thread
    pub fn id(&self) -> usize {
        self.id
    }

    /// Get the raw sibling list of this thread's physical core, e.g. "12,36"
    pub fn siblings(&self) -> &str {
        &self.siblings
    }

    /// Parse the sibling list into thread indices.
    pub fn sibling_threads(&self) -> Result<Vec<usize>> {
        read_cpulist(&self.siblings)
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    threads: Vec<HardwareThread>,
    nr_thread_ids: usize,
}

impl Topology {
    /// Build the Topology of the running host.
    pub fn new() -> Result<Topology> {
        Self::with_root(SYSFS_CPU_ROOT)
    }

    /// Build a Topology from a sysfs-like CPU directory, one `cpuN`
    /// subdirectory per logical CPU.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Result<Topology> {
        let root = root.as_ref();
        let pattern = root.join("cpu[0-9]*");
        let cpu_paths =
            glob(&pattern.to_string_lossy()).map_err(|e| Error::topology(root, e))?;

        let mut threads = Vec::new();
        for cpu_path in cpu_paths {
            let cpu_path = cpu_path.map_err(|e| Error::topology(root, e))?;
            let name = match cpu_path.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.to_string(),
                None => return Err(Error::topology(&cpu_path, "entry name is not valid UTF-8")),
            };
            let id = sscanf!(name.as_str(), "cpu{usize}").map_err(|_| {
                Error::topology(&cpu_path, format!("unexpected CPU entry name {name}"))
            })?;

            let siblings_path = cpu_path.join("topology").join("thread_siblings_list");
            let siblings = read_siblings(&siblings_path)?;

            debug!(cpu_id = %name, threads = %siblings, "CPU threads");
            threads.push(HardwareThread::new(&name, id, &siblings));
        }

        let topo = Self::build(threads).map_err(|reason| Error::topology(root, reason))?;
        debug!(topology = ?topo.threads, "CPU topology");
        Ok(topo)
    }

    /// Build a Topology out of already known threads, e.g. a snapshot taken
    /// on another host.
    pub fn from_threads(threads: Vec<HardwareThread>) -> Result<Topology> {
        Self::build(threads).map_err(|reason| Error::topology("<memory>", reason))
    }

    fn build(mut threads: Vec<HardwareThread>) -> std::result::Result<Topology, String> {
        if threads.is_empty() {
            return Err("no logical CPUs found".to_string());
        }
        threads.sort_by_key(|thread| thread.id);

        let mut nr_thread_ids = threads.len();
        for (pos, thread) in threads.iter().enumerate() {
            if thread.id < pos {
                return Err(format!("duplicate CPU id {}", thread.id));
            }
            if thread.id > pos {
                return Err(format!("missing CPU id {pos}"));
            }
            let siblings = thread
                .sibling_threads()
                .map_err(|e| format!("{}: {e}", thread.name))?;
            if let Some(max) = siblings.iter().max() {
                nr_thread_ids = nr_thread_ids.max(max + 1);
            }
        }

        Ok(Topology {
            threads,
            nr_thread_ids,
        })
    }

    /// Get the threads sorted by id. The id of a thread is its index.
    pub fn threads(&self) -> &[HardwareThread] {
        &self.threads
    }

    pub fn get(&self, idx: usize) -> Option<&HardwareThread> {
        self.threads.get(idx)
    }

    /// Get the number of hardware threads
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Get one past the highest thread id referenced anywhere in the
    /// Topology, including sibling lists.
    pub fn nr_thread_ids(&self) -> usize {
        self.nr_thread_ids
    }
}

fn read_siblings(path: &Path) -> Result<String> {
    let val = std::fs::read_to_string(path).map_err(|e| Error::topology(path, e))?;
    let val = val.trim_end_matches('\0').trim();
    if val.is_empty() {
        return Err(Error::topology(path, "empty thread sibling list"));
    }
    Ok(val.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_sysfs(cpus: &[(&str, &str)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (name, siblings) in cpus {
            let top = tmp.path().join(name).join("topology");
            fs::create_dir_all(&top).unwrap();
            fs::write(top.join("thread_siblings_list"), format!("{siblings}\n")).unwrap();
        }
        tmp
    }

    #[test]
    fn test_sorted_by_id() {
        // Lexical order would put cpu10 before cpu2.
        let cpus: Vec<(String, String)> = (0..12)
            .map(|i| (format!("cpu{i}"), format!("{},{}", i, i + 12)))
            .collect();
        let cpus: Vec<(&str, &str)> = cpus
            .iter()
            .map(|(n, s)| (n.as_str(), s.as_str()))
            .collect();
        let tmp = fake_sysfs(&cpus);

        let topo = Topology::with_root(tmp.path()).unwrap();
        assert_eq!(topo.len(), 12);
        for (pos, thread) in topo.threads().iter().enumerate() {
            assert_eq!(thread.id(), pos);
            assert_eq!(thread.name(), format!("cpu{pos}"));
            assert_eq!(thread.siblings(), format!("{},{}", pos, pos + 12));
        }
        assert_eq!(topo.nr_thread_ids(), 24);
    }

    #[test]
    fn test_ignores_other_entries() {
        let tmp = fake_sysfs(&[("cpu0", "0,1"), ("cpu1", "0,1")]);
        fs::create_dir_all(tmp.path().join("cpufreq")).unwrap();
        fs::create_dir_all(tmp.path().join("cpuidle")).unwrap();
        fs::write(tmp.path().join("online"), "0-1\n").unwrap();

        let topo = Topology::with_root(tmp.path()).unwrap();
        assert_eq!(topo.len(), 2);
        assert_eq!(topo.get(1).unwrap().sibling_threads().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_missing_siblings_is_fatal() {
        let tmp = fake_sysfs(&[("cpu0", "0"), ("cpu1", "1")]);
        fs::create_dir_all(tmp.path().join("cpu2")).unwrap();

        match Topology::with_root(tmp.path()) {
            Err(Error::TopologyRead { path, .. }) => {
                assert!(path.ends_with("cpu2/topology/thread_siblings_list"));
            }
            other => panic!("Expected topology error, got {:?}", other),
        }
    }

    #[test]
    fn test_non_numeric_suffix_is_fatal() {
        let tmp = fake_sysfs(&[("cpu0", "0"), ("cpu1x", "1")]);
        assert!(matches!(
            Topology::with_root(tmp.path()),
            Err(Error::TopologyRead { .. })
        ));
    }

    #[test]
    fn test_gap_is_fatal() {
        let tmp = fake_sysfs(&[("cpu0", "0"), ("cpu2", "2")]);
        assert!(Topology::with_root(tmp.path()).is_err());
    }

    #[test]
    fn test_empty_root_is_fatal() {
        let tmp = TempDir::new().unwrap();
        assert!(Topology::with_root(tmp.path()).is_err());
        assert!(Topology::with_root(tmp.path().join("nope")).is_err());
    }

    #[test]
    fn test_malformed_siblings_is_fatal() {
        let tmp = fake_sysfs(&[("cpu0", "zero")]);
        assert!(Topology::with_root(tmp.path()).is_err());
    }

    #[test]
    fn test_huge_sibling_id_is_fatal() {
        let tmp = fake_sysfs(&[("cpu0", "0-18446744073709551615")]);
        assert!(Topology::with_root(tmp.path()).is_err());
        assert!(Topology::from_threads(vec![HardwareThread::new("cpu0", 0, "0,65536")]).is_err());
    }

    #[test]
    fn test_from_threads() {
        let topo = Topology::from_threads(vec![
            HardwareThread::new("cpu1", 1, "1,3"),
            HardwareThread::new("cpu0", 0, "0,2"),
        ])
        .unwrap();
        assert_eq!(topo.get(0).unwrap().name(), "cpu0");
        assert_eq!(topo.nr_thread_ids(), 4);

        assert!(Topology::from_threads(vec![
            HardwareThread::new("cpu0", 0, "0"),
            HardwareThread::new("cpu0", 0, "0"),
        ])
        .is_err());
        assert!(Topology::from_threads(vec![]).is_err());
    }
}
