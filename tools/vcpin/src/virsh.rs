// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! libvirt control plane driven through the `virsh` command line client.
//!
//! Every request runs `virsh -c <uri> <command>`; guests are identified by
//! domain name.

use std::process::Command;

use anyhow::anyhow;
use anyhow::Result;
use tracing::debug;
use vcpin_utils::AffinityMask;
use vcpin_utils::Error;
use vcpin_utils::Hypervisor;

#[derive(Debug)]
pub struct Virsh {
    bin: String,
    uri: String,
}

impl Virsh {
    /// Check that `uri` can be reached before handing out a client.
    pub fn connect(bin: &str, uri: &str) -> Result<Virsh> {
        let virsh = Virsh {
            bin: bin.to_string(),
            uri: uri.to_string(),
        };
        let canonical = virsh
            .run(&["uri"])
            .map_err(|e| anyhow!("Failed to connect to {uri}: {e}"))?;
        debug!(uri = %canonical.trim(), "Connected to hypervisor");
        Ok(virsh)
    }

    fn run(&self, args: &[&str]) -> std::result::Result<String, String> {
        let output = Command::new(&self.bin)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .output()
            .map_err(|e| format!("failed to run {}: {e}", self.bin))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            return Err(if stderr.is_empty() {
                format!("{} {} exited with {}", self.bin, args.join(" "), output.status)
            } else {
                stderr.to_string()
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn query(&self, args: &[&str]) -> vcpin_utils::Result<String> {
        self.run(args).map_err(Error::Hypervisor)
    }
}

impl Hypervisor for Virsh {
    type Guest = String;

    fn count_host_threads(&self) -> vcpin_utils::Result<usize> {
        parse_cpus(&self.query(&["nodeinfo"])?)
    }

    fn list_active_guests(&self) -> vcpin_utils::Result<Vec<String>> {
        Ok(parse_domain_list(&self.query(&["list", "--name"])?))
    }

    fn guest_vcpu_count(&self, guest: &String) -> vcpin_utils::Result<usize> {
        parse_cpus(&self.query(&["dominfo", guest.as_str()])?)
    }

    fn guest_name(&self, guest: &String) -> vcpin_utils::Result<String> {
        Ok(guest.clone())
    }

    fn apply_vcpu_affinity(
        &self,
        guest: &String,
        vcpu: usize,
        mask: &[u8],
        nr_bits: usize,
    ) -> vcpin_utils::Result<()> {
        let pinning_error = |reason: String| Error::Pinning {
            guest: guest.clone(),
            vcpu,
            reason,
        };

        let mask = AffinityMask::from_bytes(mask);
        if mask.is_empty() {
            return Err(pinning_error("empty affinity mask".to_string()));
        }
        if let Some(thread) = mask.iter().find(|thread| *thread >= nr_bits) {
            return Err(pinning_error(format!(
                "thread {thread} is beyond the {nr_bits} host threads"
            )));
        }

        let cpulist = mask.to_cpulist();
        let vcpu_str = vcpu.to_string();
        self.run(&["vcpupin", guest.as_str(), vcpu_str.as_str(), cpulist.as_str(), "--live"])
            .map(|_| ())
            .map_err(pinning_error)
    }
}

/// Extract the "CPU(s):" field of `virsh nodeinfo` or `virsh dominfo`.
fn parse_cpus(output: &str) -> vcpin_utils::Result<usize> {
    for line in output.lines() {
        if let Some(val) = line.trim().strip_prefix("CPU(s):") {
            let val = val.trim();
            return val
                .parse::<usize>()
                .map_err(|_| Error::Hypervisor(format!("Failed to parse CPU count '{val}'")));
        }
    }
    Err(Error::Hypervisor("No CPU(s) field in virsh output".to_string()))
}

fn parse_domain_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
