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

use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// The emulated datacenter: networks, nodes, pods and what they need.
///
/// Consumed read-only by the runtime.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Cluster {
    pub networks: Vec<NetworkSpec>,
    pub images: Vec<ImageSpec>,
    pub data_folders: Vec<DataFolderSpec>,
    pub nodes: Vec<NodeSpec>,
    pub pods: Vec<PodSpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    #[default]
    Internal,
    External,
    /// Carries the addresses announced by guests for their BMC.
    Bmc,
}

/// A bridge on the host.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: NetworkKind,
    #[serde(default)]
    pub use_nat: bool,
    /// Host side address of the bridge in CIDR notation, e.g. `10.0.0.1/24`.
    #[serde(default)]
    pub address: Option<String>,
}

/// A disk image, either on the local filesystem or fetched into the image
/// cache beforehand under its URL.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_image_format")]
    pub format: String,
}

fn default_image_format() -> String {
    "qcow2".into()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataFolderSpec {
    pub name: String,
    #[serde(default)]
    pub files: Vec<DataFileSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataFileSpec {
    pub name: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SmbiosSpec {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

/// A virtual machine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeSpec {
    pub name: String,
    /// Names of the bridges each NIC is attached to, in NIC order.
    pub interfaces: Vec<String>,
    pub cpu: u32,
    /// Memory size as understood by `qemu -m`, e.g. `2G`.
    pub memory: Option<String>,
    pub uefi: bool,
    /// Ignition configuration passed to the guest through fw_cfg.
    pub ignition: Option<PathBuf>,
    pub smbios: SmbiosSpec,
    pub volumes: Vec<VolumeSpec>,
}

impl NodeSpec {
    /// The SMBIOS serial number. Defaults to the hex encoded SHA-1 of the
    /// node name.
    pub fn serial(&self) -> String {
        match &self.smbios.serial {
            Some(serial) if !serial.is_empty() => serial.clone(),
            _ => default_serial(&self.name),
        }
    }
}

pub fn default_serial(name: &str) -> String {
    format!("{:x}", Sha1::digest(name.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VolumeSpec {
    /// A copy-on-write overlay on top of a named image.
    Image { name: String, image: String },
    /// An empty qcow2 disk of the given size.
    Raw { name: String, size: String },
    /// A data folder exposed to the guest as a FAT drive.
    Vvfat { name: String, folder: String },
}

impl VolumeSpec {
    pub fn name(&self) -> &str {
        match self {
            VolumeSpec::Image { name, .. }
            | VolumeSpec::Raw { name, .. }
            | VolumeSpec::Vvfat { name, .. } => name,
        }
    }
}

/// A group of rkt applications sharing a network namespace.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PodSpec {
    pub name: String,
    pub init_scripts: Vec<PathBuf>,
    pub interfaces: Vec<PodInterfaceSpec>,
    pub volumes: Vec<PodVolumeSpec>,
    pub apps: Vec<AppSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodInterfaceSpec {
    pub network: String,
    /// Addresses in CIDR notation assigned inside the pod, in order.
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodVolumeSpec {
    pub name: String,
    /// Data folder mounted as the volume.
    pub folder: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSpec {
    pub name: String,
    pub image: String,
    pub readonly_rootfs: bool,
    pub user: Option<String>,
    pub group: Option<String>,
    pub exec: Option<String>,
    pub args: Vec<String>,
    pub mount: Vec<AppMountSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppMountSpec {
    pub volume: String,
    pub target: String,
}
