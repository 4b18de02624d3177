use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashSet;

use vcpin_utils::collect_guests;
use vcpin_utils::run_cycle;
use vcpin_utils::AffinityMask;
use vcpin_utils::Error;
use vcpin_utils::GuestList;
use vcpin_utils::HardwareThread;
use vcpin_utils::Hypervisor;
use vcpin_utils::Placement;
use vcpin_utils::Result;
use vcpin_utils::Topology;

/// In-memory control plane recording every pin request.
struct FakeHypervisor {
    host_threads: usize,
    guests: Vec<(String, usize)>,
    reject: Option<(String, usize)>,
    vanished: Option<String>,
    pins: RefCell<Vec<(String, usize, Vec<u8>, usize)>>,
}

impl FakeHypervisor {
    fn new(host_threads: usize, guests: &[(&str, usize)]) -> Self {
        Self {
            host_threads,
            guests: guests.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
            reject: None,
            vanished: None,
            pins: RefCell::new(Vec::new()),
        }
    }

    fn pinned(&self) -> BTreeMap<(String, usize), String> {
        self.pins
            .borrow()
            .iter()
            .map(|(name, vcpu, mask, _)| {
                ((name.clone(), *vcpu), AffinityMask::from_bytes(mask).to_cpulist())
            })
            .collect()
    }
}

impl Hypervisor for FakeHypervisor {
    type Guest = usize;

    fn count_host_threads(&self) -> Result<usize> {
        Ok(self.host_threads)
    }

    fn list_active_guests(&self) -> Result<Vec<usize>> {
        Ok((0..self.guests.len()).collect())
    }

    fn guest_vcpu_count(&self, guest: &usize) -> Result<usize> {
        let (name, nr_vcpus) = &self.guests[*guest];
        if self.vanished.as_ref() == Some(name) {
            return Err(Error::Hypervisor(format!(
                "error: failed to get domain '{name}'"
            )));
        }
        Ok(*nr_vcpus)
    }

    fn guest_name(&self, guest: &usize) -> Result<String> {
        Ok(self.guests[*guest].0.clone())
    }

    fn apply_vcpu_affinity(
        &self,
        guest: &usize,
        vcpu: usize,
        mask: &[u8],
        nr_bits: usize,
    ) -> Result<()> {
        let name = self.guests[*guest].0.clone();
        if self.reject == Some((name.clone(), vcpu)) {
            return Err(Error::Pinning {
                guest: name,
                vcpu,
                reason: "domain is not running".to_string(),
            });
        }
        self.pins
            .borrow_mut()
            .push((name, vcpu, mask.to_vec(), nr_bits));
        Ok(())
    }
}

/// `nr_cores` cores with two hyperthreads each, numbered the way Linux does:
/// thread `i` and `i + nr_cores` share a core.
fn smt_topology(nr_cores: usize) -> Topology {
    let nr_threads = nr_cores * 2;
    Topology::from_threads(
        (0..nr_threads)
            .map(|i| {
                let core = i % nr_cores;
                HardwareThread::new(
                    &format!("cpu{i}"),
                    i,
                    &format!("{},{}", core, core + nr_cores),
                )
            })
            .collect(),
    )
    .unwrap()
}

#[test]
fn test_end_to_end_two_guests() {
    let topo = smt_topology(8);
    let hv = FakeHypervisor::new(16, &[("alpha", 4), ("beta", 2)]);
    let guests = collect_guests(&hv).unwrap();

    let report = run_cycle(&hv, &guests, 16, &topo, Placement::SiblingGroup).unwrap();
    assert!(report.success());
    assert_eq!(report.nr_guests, 2);
    assert_eq!(report.nr_pinned, 6);

    let pinned = hv.pinned();
    let expect = [
        (("alpha", 0), "4,12"),
        (("alpha", 1), "5,13"),
        (("alpha", 2), "6,14"),
        (("alpha", 3), "7,15"),
        (("beta", 0), "2,10"),
        (("beta", 1), "3,11"),
    ];
    assert_eq!(pinned.len(), expect.len());
    for ((name, vcpu), cpulist) in expect {
        assert_eq!(pinned[&(name.to_string(), vcpu)], cpulist, "{name} vCPU {vcpu}");
    }

    for (_, _, mask, nr_bits) in hv.pins.borrow().iter() {
        assert_eq!(mask.len(), 2);
        assert_eq!(*nr_bits, 16);
    }
}

#[test]
fn test_guests_are_sorted_by_name() {
    let hv = FakeHypervisor::new(8, &[("web02", 1), ("db01", 1), ("web01", 1)]);
    let names: Vec<String> = collect_guests(&hv)
        .unwrap()
        .guests
        .into_iter()
        .map(|g| g.name)
        .collect();
    assert_eq!(names, vec!["db01", "web01", "web02"]);

    let topo = smt_topology(4);
    let guests = collect_guests(&hv).unwrap();
    run_cycle(&hv, &guests, 8, &topo, Placement::SingleThread).unwrap();
    let pinned = hv.pinned();
    assert_eq!(pinned[&("db01".to_string(), 0)], "7");
    assert_eq!(pinned[&("web01".to_string(), 0)], "6");
    assert_eq!(pinned[&("web02".to_string(), 0)], "5");
}

#[test]
fn test_capacity_guard_pins_nothing() {
    let topo = smt_topology(4);
    let hv = FakeHypervisor::new(8, &[("a", 4), ("b", 3), ("c", 2)]);
    let guests = collect_guests(&hv).unwrap();

    match run_cycle(&hv, &guests, 8, &topo, Placement::SiblingGroup) {
        Err(Error::Capacity {
            requested,
            available,
        }) => {
            assert_eq!(requested, 9);
            assert_eq!(available, 8);
        }
        other => panic!("Expected capacity error, got {:?}", other),
    }
    assert!(hv.pins.borrow().is_empty());
}

#[test]
fn test_single_thread_is_exclusive() {
    let topo = smt_topology(12);
    let sizes = [("a", 5), ("b", 1), ("c", 0), ("d", 7), ("e", 11)];
    let hv = FakeHypervisor::new(24, &sizes);
    let guests = collect_guests(&hv).unwrap();

    let report = run_cycle(&hv, &guests, 24, &topo, Placement::SingleThread).unwrap();
    assert!(report.success());
    assert_eq!(report.nr_pinned, 24);

    let mut seen = HashSet::new();
    for (_, _, mask, _) in hv.pins.borrow().iter() {
        let mask = AffinityMask::from_bytes(mask);
        assert_eq!(mask.weight(), 1);
        for thread in mask.iter() {
            assert!(seen.insert(thread), "thread {thread} pinned twice");
        }
    }
    assert_eq!(seen.len(), 24);
}

#[test]
fn test_rejected_vcpu_does_not_stop_cycle() {
    let topo = smt_topology(4);
    let mut hv = FakeHypervisor::new(8, &[("a", 2), ("b", 2)]);
    hv.reject = Some(("a".to_string(), 0));
    let guests = collect_guests(&hv).unwrap();

    let report = run_cycle(&hv, &guests, 8, &topo, Placement::SiblingGroup).unwrap();
    assert!(!report.success());
    assert_eq!(report.nr_guests, 2);
    assert_eq!(report.nr_pinned, 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].guest, "a");
    assert_eq!(report.failures[0].vcpu, 0);
    assert!(matches!(report.failures[0].error, Error::Pinning { .. }));
}

#[test]
fn test_no_guests() {
    let topo = smt_topology(2);
    let hv = FakeHypervisor::new(4, &[]);
    let guests: GuestList<usize> = collect_guests(&hv).unwrap();

    let report = run_cycle(&hv, &guests, 4, &topo, Placement::SiblingGroup).unwrap();
    assert!(report.success());
    assert_eq!(report.nr_guests, 0);
    assert!(hv.pins.borrow().is_empty());
}

#[test]
fn test_host_larger_than_topology() {
    let topo = smt_topology(2);
    let hv = FakeHypervisor::new(8, &[("a", 1)]);
    let guests = collect_guests(&hv).unwrap();

    assert!(run_cycle(&hv, &guests, 8, &topo, Placement::SiblingGroup).is_err());
    assert!(hv.pins.borrow().is_empty());

    // A guest without vCPUs needs no thread at all.
    let hv = FakeHypervisor::new(8, &[("idle", 0)]);
    let guests = collect_guests(&hv).unwrap();
    let report = run_cycle(&hv, &guests, 8, &topo, Placement::SiblingGroup).unwrap();
    assert!(report.success());
    assert_eq!(report.nr_guests, 1);
    assert_eq!(report.nr_pinned, 0);
}

#[test]
fn test_vanished_guest_is_skipped() {
    let topo = smt_topology(4);
    let mut hv = FakeHypervisor::new(8, &[("gone", 2), ("web01", 2)]);
    hv.vanished = Some("gone".to_string());

    let guests = collect_guests(&hv).unwrap();
    assert_eq!(guests.guests.len(), 1);
    assert_eq!(guests.skipped.len(), 1);
    assert_eq!(guests.skipped[0].guest, "gone");
    assert!(guests.skipped[0].reason.contains("failed to get domain 'gone'"));

    let report = run_cycle(&hv, &guests, 8, &topo, Placement::SiblingGroup).unwrap();
    assert!(!report.success());
    assert!(report.failures.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.nr_guests, 1);
    assert_eq!(report.nr_pinned, 2);

    // The remaining guest still gets the top of the host.
    let pinned = hv.pinned();
    assert_eq!(pinned[&("web01".to_string(), 0)], "2,6");
    assert_eq!(pinned[&("web01".to_string(), 1)], "3,7");
}
