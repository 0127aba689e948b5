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

//! Configuration for a placemat run.
//!
//! A single TOML document describes both how the runtime behaves
//! (`[runtime]`, `[bmc]`) and the emulated cluster itself (`[[networks]]`,
//! `[[images]]`, `[[data_folders]]`, `[[nodes]]`, `[[pods]]`).

pub use self::cluster::{
    default_serial, AppMountSpec, AppSpec, Cluster, DataFileSpec,
    DataFolderSpec, ImageSpec, NetworkKind, NetworkSpec, NodeSpec,
    PodInterfaceSpec, PodSpec, PodVolumeSpec, SmbiosSpec, VolumeSpec,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod cluster;

pub const DEFAULT_DATA_DIR: &str = "/var/scratch/placemat";
pub const DEFAULT_CACHE_DIR: &str = "/var/cache/placemat";
pub const DEFAULT_RUN_DIR: &str = "/tmp";
pub const DEFAULT_BMC_LISTEN: &str = "127.0.0.1:9623";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    FailedToRead { path: PathBuf, source: std::io::Error },
    #[error("config '{path}' is empty")]
    Empty { path: PathBuf },
    #[error("invalid config: {0}")]
    Invalid(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlacematConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub bmc: BmcConfig,
    #[serde(flatten)]
    pub cluster: Cluster,
}

impl PlacematConfig {
    /// Attempt to parse a config file into memory.
    pub fn parse_from_toml_file<P: AsRef<Path>>(
        path: P,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config_toml = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::FailedToRead { path: path.to_path_buf(), source: e }
        })?;
        if config_toml.trim().is_empty() {
            return Err(ConfigError::Empty { path: path.to_path_buf() });
        }
        Self::parse_from_toml(&config_toml)
    }

    pub fn parse_from_toml(config_toml: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(config_toml)?)
    }
}

/// Where the runtime keeps its state and how it presents VMs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Directory for the VMs' control and serial sockets.
    pub run_dir: PathBuf,
    /// Redirect each VM's console to a unix socket instead of a window.
    pub nographic: bool,
    /// Forward the hypervisor's stderr to the log.
    pub debug: bool,
    /// How long stopping tasks may take after cancellation before they are
    /// aborted.
    pub shutdown_grace_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: DEFAULT_DATA_DIR.into(),
            cache_dir: DEFAULT_CACHE_DIR.into(),
            run_dir: DEFAULT_RUN_DIR.into(),
            nographic: false,
            debug: false,
            shutdown_grace_secs: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BmcConfig {
    /// Address accepting power-control requests.
    pub listen: SocketAddr,
}

impl Default for BmcConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_BMC_LISTEN
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 9623))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const INPUT: &str = r#"
[runtime]
data_dir = "/srv/placemat"
nographic = true

[bmc]
listen = "0.0.0.0:6230"

[[networks]]
name = "ext-net"
type = "external"
use_nat = true
address = "10.0.0.1/24"

[[networks]]
name = "bmc-net"
type = "bmc"
address = "10.72.16.1/20"

[[images]]
name = "ubuntu"
url = "https://example.com/ubuntu.img"

[[data_folders]]
name = "sabakan-data"
files = [{ name = "sabakan", file = "/usr/local/bin/sabakan" }]

[[nodes]]
name = "boot-0"
interfaces = ["ext-net", "bmc-net"]
cpu = 2
memory = "2G"
uefi = true

[nodes.smbios]
manufacturer = "cybozu"

[[nodes.volumes]]
kind = "image"
name = "root"
image = "ubuntu"

[[nodes.volumes]]
kind = "raw"
name = "data"
size = "10G"

[[pods]]
name = "bird"
init_scripts = ["/usr/local/bin/setup-iptables"]

[[pods.interfaces]]
network = "ext-net"
addresses = ["10.0.0.5/24"]

[[pods.apps]]
name = "bird"
image = "docker://quay.io/cybozu/bird:2.0"
readonly_rootfs = true
"#;

    #[test]
    fn can_parse_full_config() {
        let config = PlacematConfig::parse_from_toml(INPUT).expect("parse");

        assert_eq!(config.runtime.data_dir, PathBuf::from("/srv/placemat"));
        assert_eq!(config.runtime.cache_dir, PathBuf::from(DEFAULT_CACHE_DIR));
        assert!(config.runtime.nographic);
        assert_eq!(config.bmc.listen.port(), 6230);

        let cluster = &config.cluster;
        assert_eq!(cluster.networks.len(), 2);
        assert_eq!(cluster.networks[0].kind, NetworkKind::External);
        assert_eq!(cluster.networks[1].kind, NetworkKind::Bmc);
        assert_eq!(cluster.images[0].format, "qcow2");
        assert_eq!(cluster.data_folders[0].files.len(), 1);

        let node = &cluster.nodes[0];
        assert_eq!(node.interfaces, vec!["ext-net", "bmc-net"]);
        assert_eq!(node.memory.as_deref(), Some("2G"));
        assert_eq!(node.smbios.manufacturer.as_deref(), Some("cybozu"));
        assert_eq!(
            node.volumes,
            vec![
                VolumeSpec::Image { name: "root".into(), image: "ubuntu".into() },
                VolumeSpec::Raw { name: "data".into(), size: "10G".into() },
            ]
        );

        let pod = &cluster.pods[0];
        assert_eq!(pod.interfaces[0].addresses, vec!["10.0.0.5/24"]);
        assert!(pod.apps[0].readonly_rootfs);
    }

    #[test]
    fn defaults_apply_to_empty_sections() {
        let config = PlacematConfig::parse_from_toml("[runtime]\n").expect("parse");
        assert_eq!(config.runtime.run_dir, PathBuf::from(DEFAULT_RUN_DIR));
        assert_eq!(config.bmc.listen.to_string(), DEFAULT_BMC_LISTEN);
        assert!(config.cluster.nodes.is_empty());
    }

    #[test]
    fn rejects_unknown_volume_kind() {
        let input = r#"
[[nodes]]
name = "n"
[[nodes.volumes]]
kind = "floppy"
name = "a"
"#;
        assert!(matches!(
            PlacematConfig::parse_from_toml(input),
            Err(ConfigError::Invalid(_))
        ));
    }
}
