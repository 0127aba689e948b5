/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use crate::command::CommandSpec;
use crate::config::NodeSpec;
use crate::host::HostCapabilities;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const QEMU_BINARY: &str = "qemu-system-x86_64";
pub const OVMF_CODE_PATH: &str = "/usr/share/OVMF/OVMF_CODE.fd";
pub const OVMF_VARS_PATH: &str = "/usr/share/OVMF/OVMF_VARS.fd";
pub const REBOOT_TIMEOUT: Duration = Duration::from_secs(30);

/// Unix socket carrying the serial console when running without graphics.
pub fn socket_path(run_dir: &Path, node: &str) -> PathBuf {
    run_dir.join(format!("{node}.socket"))
}

pub fn monitor_socket_path(run_dir: &Path, node: &str) -> PathBuf {
    run_dir.join(format!("{node}.monitor"))
}

/// Per node copy of the UEFI variable store.
pub fn nvram_path(data_dir: &Path, node: &str) -> PathBuf {
    data_dir.join("nvram").join(format!("{node}.fd"))
}

/// A NIC of the VM backed by a tap on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub bridge: String,
    pub tap: String,
    pub mac: String,
}

/// Builds the hypervisor command line of one node.
#[derive(Debug, Clone)]
pub struct QemuArgs<'a> {
    pub node: &'a NodeSpec,
    pub run_dir: &'a Path,
    pub data_dir: &'a Path,
    pub nographic: bool,
    pub capabilities: HostCapabilities,
    /// `-drive` arguments of the prepared volumes.
    pub volume_args: &'a [String],
    pub interfaces: &'a [NetInterface],
}

impl QemuArgs<'_> {
    fn machine_args(&self) -> Vec<String> {
        let node = self.node;
        let mut args = vec!["-enable-kvm".to_string()];

        if let Some(ignition) = &node.ignition {
            args.push("-fw_cfg".into());
            args.push(format!(
                "opt/com.coreos/config,file={}",
                ignition.display()
            ));
        }
        if node.cpu != 0 {
            args.extend(["-smp".into(), node.cpu.to_string()]);
        }
        if let Some(memory) = node.memory.as_ref().filter(|m| !m.is_empty()) {
            args.extend(["-m".into(), memory.clone()]);
        }
        if self.nographic {
            let socket = socket_path(self.run_dir, &node.name);
            args.push("-nographic".into());
            args.push("-serial".into());
            args.push(format!("unix:{},server,nowait", socket.display()));
        }
        if node.uefi {
            let nvram = nvram_path(self.data_dir, &node.name);
            args.push("-drive".into());
            args.push(format!(
                "if=pflash,file={OVMF_CODE_PATH},format=raw,readonly"
            ));
            args.push("-drive".into());
            args.push(format!("if=pflash,file={},format=raw", nvram.display()));
        }

        let mut smbios = String::from("type=1");
        fn non_empty(value: &Option<String>) -> Option<&str> {
            value.as_deref().filter(|v| !v.is_empty())
        }
        if let Some(manufacturer) = non_empty(&node.smbios.manufacturer) {
            smbios.push_str(&format!(",manufacturer={manufacturer}"));
        }
        if let Some(product) = non_empty(&node.smbios.product) {
            smbios.push_str(&format!(",product={product}"));
        }
        smbios.push_str(&format!(",serial={}", node.serial()));
        args.extend(["-smbios".into(), smbios]);
        args
    }

    fn interface_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.interfaces.len() * 4);
        // taps are unique per host, bridges may repeat
        for NetInterface { tap, mac, .. } in self.interfaces {
            let mut netdev =
                format!("tap,id={tap},ifname={tap},script=no,downscript=no");
            if self.capabilities.vhost_net {
                netdev.push_str(",vhost=on");
            }
            args.extend(["-netdev".into(), netdev]);

            let mut device =
                format!("virtio-net-pci,netdev={tap},mac={mac}");
            if self.node.uefi {
                // no iPXE option ROM
                device.push_str(",romfile=");
            }
            args.extend(["-device".into(), device]);
        }
        args
    }

    pub fn args(&self) -> Vec<String> {
        let monitor = monitor_socket_path(self.run_dir, &self.node.name);
        let mut args = self.volume_args.to_vec();
        args.extend(self.machine_args());
        args.extend(self.interface_args());
        args.extend([
            "-boot".into(),
            format!("reboot-timeout={}", REBOOT_TIMEOUT.as_millis()),
            "-serial".into(),
            "stdio".into(),
            "-monitor".into(),
            format!("unix:{},server,nowait", monitor.display()),
        ]);
        args
    }

    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(QEMU_BINARY, self.args())
    }
}
