//! Command families whose rules expand against the live system.
//!
//! | family    | expands to one task per                | probe                 |
//! |-----------|----------------------------------------|-----------------------|
//! | `ethtool` | ethernet interface                     | `/sbin/ip -o link`    |
//! | `modinfo` | loaded kernel module                   | `/sys/module`         |
//! | `parted`  | block device (except `ram*`)           | `/sys/block`          |
//!
//! `hostname` is not expanded; the collector answers it directly.

use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::process::{probe_timeout, run_program};

/// Read-only view of the system used to expand special families.
#[cfg_attr(test, mockall::automock)]
pub trait SystemProbe: Send + Sync {
    fn ethernet_interfaces(&self) -> Vec<String>;
    fn loaded_modules(&self) -> Vec<String>;
    fn block_devices(&self) -> Vec<String>;
}

/// Probe backed by the running kernel.
#[derive(Debug, Clone)]
pub struct LiveSystem {
    sys_root: PathBuf,
}

impl Default for LiveSystem {
    fn default() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
        }
    }
}

impl LiveSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(e) => {
                debug!("Cannot list {}: {}", dir.display(), e);
                Vec::new()
            }
        };
        names.sort();
        names
    }
}

/// Interface names from `ip -o link` output lines carrying `link/ether`.
pub fn parse_ethernet_interfaces(ip_output: &str) -> Vec<String> {
    ip_output
        .lines()
        .filter(|line| line.contains("link/ether"))
        .filter_map(|line| line.split(':').nth(1))
        .map(|name| name.trim().split('@').next().unwrap_or("").to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

impl SystemProbe for LiveSystem {
    fn ethernet_interfaces(&self) -> Vec<String> {
        match run_program("/sbin/ip", &["-o", "link"], probe_timeout()) {
            Ok(out) if out.success() => parse_ethernet_interfaces(&out.stdout),
            Ok(out) => {
                warn!("ip -o link exited with status {}", out.status);
                Vec::new()
            }
            Err(e) => {
                warn!("Could not list network interfaces: {:#}", e);
                Vec::new()
            }
        }
    }

    fn loaded_modules(&self) -> Vec<String> {
        Self::sorted_entries(&self.sys_root.join("module"))
    }

    fn block_devices(&self) -> Vec<String> {
        Self::sorted_entries(&self.sys_root.join("block"))
            .into_iter()
            .filter(|dev| !dev.starts_with("ram"))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    Ethtool,
    Modinfo,
    Parted,
}

fn program_name(command_line: &str) -> Option<&str> {
    let program = command_line.split_whitespace().next()?;
    Some(program.rsplit('/').next().unwrap_or(program))
}

pub fn family_of(command_line: &str) -> Option<CommandFamily> {
    match program_name(command_line)? {
        name if name.starts_with("ethtool") => Some(CommandFamily::Ethtool),
        name if name.starts_with("modinfo") => Some(CommandFamily::Modinfo),
        name if name.starts_with("parted") => Some(CommandFamily::Parted),
        _ => None,
    }
}

/// True for a bare `hostname` invocation, which is answered without spawning.
pub fn is_hostname_command(command_line: &str) -> bool {
    command_line.split_whitespace().count() == 1 && program_name(command_line) == Some("hostname")
}

/// Expand a command of a special family into concrete command lines.
///
/// Returns `None` for commands outside the special families.
pub fn expand_family(command_line: &str, probe: &dyn SystemProbe) -> Option<Vec<String>> {
    let family = family_of(command_line)?;
    let expanded = match family {
        CommandFamily::Ethtool => probe
            .ethernet_interfaces()
            .into_iter()
            .map(|iface| format!("{} {}", command_line, iface))
            .collect(),
        CommandFamily::Modinfo => probe
            .loaded_modules()
            .into_iter()
            .map(|module| format!("{} {}", command_line, module))
            .collect(),
        CommandFamily::Parted => {
            let program = command_line.split_whitespace().next().unwrap_or(command_line);
            probe
                .block_devices()
                .into_iter()
                .map(|dev| format!("{} -s /dev/{} unit s print", program, dev))
                .collect()
        }
    };
    Some(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const IP_LINK: &str = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT \\    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP \\    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff
3: br0.10@br0: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN \\    link/ether 52:54:00:ab:cd:ef brd ff:ff:ff:ff:ff:ff
";

    #[test]
    fn test_parse_ethernet_interfaces() {
        assert_eq!(parse_ethernet_interfaces(IP_LINK), vec!["eth0", "br0.10"]);
    }

    #[test]
    fn test_family_detection() {
        assert_eq!(family_of("/sbin/ethtool -i"), Some(CommandFamily::Ethtool));
        assert_eq!(family_of("/sbin/modinfo"), Some(CommandFamily::Modinfo));
        assert_eq!(family_of("/usr/sbin/parted -l"), Some(CommandFamily::Parted));
        assert_eq!(family_of("/bin/uname -a"), None);
    }

    #[test]
    fn test_hostname_detection() {
        assert!(is_hostname_command("/bin/hostname"));
        assert!(is_hostname_command("hostname"));
        assert!(!is_hostname_command("/bin/hostname -I"));
    }

    #[test]
    fn test_expand_with_mock_probe() {
        let mut probe = MockSystemProbe::new();
        probe
            .expect_ethernet_interfaces()
            .returning(|| vec!["eth0".to_string(), "eth1".to_string()]);
        probe
            .expect_block_devices()
            .returning(|| vec!["sda".to_string()]);

        assert_eq!(
            expand_family("/sbin/ethtool -k", &probe).unwrap(),
            vec!["/sbin/ethtool -k eth0", "/sbin/ethtool -k eth1"]
        );
        assert_eq!(
            expand_family("/sbin/parted -l", &probe).unwrap(),
            vec!["/sbin/parted -s /dev/sda unit s print"]
        );
        assert!(expand_family("/bin/ls", &probe).is_none());
    }

    #[test]
    fn test_live_block_devices_skip_ram() {
        let dir = TempDir::new().unwrap();
        for dev in ["ram0", "sda", "nvme0n1", "ram1"] {
            fs::create_dir_all(dir.path().join("block").join(dev)).unwrap();
        }
        let probe = LiveSystem {
            sys_root: dir.path().to_path_buf(),
        };
        assert_eq!(probe.block_devices(), vec!["nvme0n1", "sda"]);
    }
}
