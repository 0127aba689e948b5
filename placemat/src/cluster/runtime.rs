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

use super::data_folder::prepare_data_folder;
use super::volume::{node_volumes, prepare_node_volumes, resolve_images};
use super::{Cache, ClusterError, Result, Rootfs, Supervisor};
use crate::bmc::BmcServer;
use crate::command::CommandRunner;
use crate::config::{BmcConfig, Cluster, RuntimeConfig};
use crate::host::HostCapabilities;
use crate::network::{
    self, create_nat_rules, create_network, destroy_nat_rules, NameGenerator,
    TAP_PREFIX, VETH_PREFIX,
};
use crate::pods::PodRuntime;
use crate::vms::{FsProbe, NodeRuntime, SocketProbe};
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lifecycle of a [ClusterRuntime].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Created,
    /// NAT rules and bridges exist.
    NetworkReady,
    /// Data folders, volumes and pod images are ready.
    ResourcesPrepared,
    Running,
    Stopping,
    Stopped,
    Destroyed,
}

impl Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Directories used by one run.
#[derive(Debug, Clone)]
pub struct RuntimeDirs {
    pub data_dir: PathBuf,
    pub volumes_dir: PathBuf,
    pub nvram_dir: PathBuf,
    pub rkt_dir: PathBuf,
    /// Unique to this run, removed by [ClusterRuntime::destroy].
    pub temp_dir: PathBuf,
    pub image_cache: Cache,
    pub data_cache: Cache,
}

async fn ensure_dir(path: &Path) -> Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(ClusterError::NotADirectory { path: path.to_path_buf() })
        }
        Err(_) => {}
    }
    tokio::fs::create_dir_all(path).await.map_err(|e| {
        ClusterError::FailedToCreateDirectory {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

impl RuntimeDirs {
    /// Creates the data and cache directory layout and a fresh temporary
    /// directory for this run.
    pub async fn create(data_dir: &Path, cache_dir: &Path) -> Result<Self> {
        ensure_dir(data_dir).await?;
        let volumes_dir = data_dir.join("volumes");
        let nvram_dir = data_dir.join("nvram");
        let rkt_dir = data_dir.join("rkt");
        let temp_root = data_dir.join("temp");
        for dir in [&volumes_dir, &nvram_dir, &rkt_dir, &temp_root] {
            ensure_dir(dir).await?;
        }
        let temp_dir = temp_root.join(uuid::Uuid::new_v4().to_string());
        ensure_dir(&temp_dir).await?;

        ensure_dir(cache_dir).await?;
        let image_cache = cache_dir.join("image_cache");
        let data_cache = cache_dir.join("data_cache");
        ensure_dir(&image_cache).await?;
        ensure_dir(&data_cache).await?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            volumes_dir,
            nvram_dir,
            rkt_dir,
            temp_dir,
            image_cache: Cache::new(image_cache),
            data_cache: Cache::new(data_cache),
        })
    }
}

/// Brings an emulated cluster up, supervises it and tears it down.
#[derive(Debug)]
pub struct ClusterRuntime {
    config: RuntimeConfig,
    runner: Arc<dyn CommandRunner>,
    probe: Arc<dyn SocketProbe>,
    capabilities: HostCapabilities,
    taps: Arc<NameGenerator>,
    veths: Arc<NameGenerator>,
    bmc: Arc<BmcServer>,
    dirs: Option<RuntimeDirs>,
    state: Mutex<ClusterState>,
}

impl ClusterRuntime {
    pub fn new(
        config: RuntimeConfig,
        bmc: &BmcConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            bmc: Arc::new(BmcServer::new(bmc.listen, runner.clone())),
            runner,
            probe: Arc::new(FsProbe),
            capabilities: HostCapabilities::probe(),
            taps: Arc::new(NameGenerator::new(TAP_PREFIX)),
            veths: Arc::new(NameGenerator::new(VETH_PREFIX)),
            dirs: None,
            state: Mutex::new(ClusterState::Created),
        }
    }

    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn state(&self) -> ClusterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: ClusterState) {
        let mut state =
            self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        info!(%from, to = %next, "cluster state");
        *state = next;
    }

    pub fn dirs(&self) -> Option<&RuntimeDirs> {
        self.dirs.as_ref()
    }

    pub fn bmc(&self) -> &Arc<BmcServer> {
        &self.bmc
    }

    /// Every tap and veth created so far.
    pub fn generated_devices(&self) -> (Vec<String>, Vec<String>) {
        (self.taps.generated_names(), self.veths.generated_names())
    }

    /// Creates the data and cache directories.
    pub async fn setup(&mut self) -> Result<()> {
        let dirs =
            RuntimeDirs::create(&self.config.data_dir, &self.config.cache_dir)
                .await?;
        info!(temp_dir = %dirs.temp_dir.display(), "runtime directories ready");
        self.dirs = Some(dirs);
        Ok(())
    }

    /// Brings `cluster` up and blocks until `token` is cancelled or a node or
    /// pod fails. Returns the first error reported by any of them.
    ///
    /// Setup failures abort before anything is launched.
    pub async fn start(
        &self,
        cluster: &Cluster,
        token: CancellationToken,
    ) -> Result<()> {
        let dirs = self.dirs.as_ref().ok_or(ClusterError::NotSetUp)?;
        if self.state() != ClusterState::Created {
            return Err(ClusterError::AlreadyStarted);
        }
        let runner = self.runner.as_ref();

        create_nat_rules(runner).await?;
        for network in &cluster.networks {
            create_network(runner, network).await?;
        }
        self.transition(ClusterState::NetworkReady);

        let mut folders = HashMap::new();
        for folder in &cluster.data_folders {
            let path =
                prepare_data_folder(folder, &dirs.temp_dir, &dirs.data_cache)
                    .await?;
            let _ = folders.insert(folder.name.clone(), path);
        }

        let images = resolve_images(&cluster.images, &dirs.image_cache)?;
        let mut node_args = Vec::with_capacity(cluster.nodes.len());
        for node in &cluster.nodes {
            let volumes = node_volumes(node, &images, &folders)?;
            let args =
                prepare_node_volumes(runner, node, &volumes, &dirs.volumes_dir)
                    .await?;
            node_args.push(args);
        }

        let pods = PodRuntime {
            runner: self.runner.clone(),
            veths: self.veths.clone(),
            folders: Arc::new(folders),
        };
        for pod in &cluster.pods {
            pods.prepare_pod(pod).await?;
        }

        let rootfs = if cluster.pods.is_empty() {
            None
        } else {
            Some(Rootfs::stage(runner, &dirs.temp_dir.join("rootfs")).await?)
        };
        self.transition(ClusterState::ResourcesPrepared);

        let result =
            self.run(cluster, node_args, pods, rootfs.as_ref(), token).await;
        if let Some(rootfs) = rootfs {
            rootfs.destroy(runner).await;
        }
        result
    }

    async fn run(
        &self,
        cluster: &Cluster,
        node_args: Vec<Vec<String>>,
        pods: PodRuntime,
        rootfs: Option<&Rootfs>,
        token: CancellationToken,
    ) -> Result<()> {
        let dirs = self.dirs.as_ref().ok_or(ClusterError::NotSetUp)?;
        self.bmc.setup(&cluster.networks).await?;

        let token = token.child_token();
        let mut supervisor =
            Supervisor::new(token.clone(), self.config.shutdown_grace());

        let bmc = self.bmc.clone();
        let bmc_token = token.clone();
        supervisor.spawn("bmc", async move {
            bmc.handle_node(bmc_token).await.map_err(ClusterError::from)
        });

        let nodes = NodeRuntime {
            runner: self.runner.clone(),
            taps: self.taps.clone(),
            bmc: self.bmc.clone(),
            probe: self.probe.clone(),
            run_dir: self.config.run_dir.clone(),
            data_dir: dirs.data_dir.clone(),
            nographic: self.config.nographic,
            debug: self.config.debug,
            capabilities: self.capabilities,
        };
        for (node, volume_args) in cluster.nodes.iter().zip(node_args) {
            let nodes = nodes.clone();
            let node = node.clone();
            let token = token.clone();
            supervisor.spawn(format!("node/{}", node.name), async move {
                nodes
                    .start_node(&node, &volume_args, token)
                    .await
                    .map_err(ClusterError::from)
            });
        }

        if let Some(root) = rootfs.map(Rootfs::path) {
            for pod in &cluster.pods {
                let pods = pods.clone();
                let pod = pod.clone();
                let root = root.clone();
                let token = token.clone();
                supervisor.spawn(format!("pod/{}", pod.name), async move {
                    pods.start_pod(&pod, &root, token)
                        .await
                        .map_err(ClusterError::from)
                });
            }
        }
        self.transition(ClusterState::Running);

        let wait = supervisor.wait();
        tokio::pin!(wait);
        let result = tokio::select! {
            result = &mut wait => result,
            _ = token.cancelled() => {
                self.transition(ClusterState::Stopping);
                wait.await
            }
        };
        self.transition(ClusterState::Stopped);
        result
    }

    /// Removes everything created for `cluster`: the run's temporary
    /// directory, taps, veths, pod namespaces, bridges and NAT rules.
    ///
    /// Safe to call after a failed [ClusterRuntime::start]. Every failure
    /// is logged and the remaining resources are still released.
    pub async fn destroy(&self, cluster: &Cluster) {
        let runner = self.runner.as_ref();

        if let Some(dirs) = &self.dirs {
            if let Err(e) = tokio::fs::remove_dir_all(&dirs.temp_dir).await {
                error!(
                    dir = %dirs.temp_dir.display(),
                    error = %e,
                    "failed to remove temporary directory"
                );
            }
        }

        for tap in self.taps.generated_names() {
            if let Err(e) = network::delete_tap(runner, &tap).await {
                error!(%tap, error = %e, "failed to delete a TAP");
            }
        }

        for veth in self.veths.generated_names() {
            if let Err(e) = network::delete_veth(runner, &veth).await {
                error!(%veth, error = %e, "failed to delete a VETH pair");
            }
        }

        for pod in &cluster.pods {
            if let Err(e) = network::delete_pod_ns(runner, &pod.name).await {
                error!(
                    pod = %pod.name,
                    error = %e,
                    "failed to delete pod network namespace"
                );
            }
        }

        for spec in &cluster.networks {
            if let Err(e) = network::destroy_network(runner, spec).await {
                error!(
                    network = %spec.name,
                    error = %e,
                    "failed to delete network"
                );
            }
        }

        if let Err(e) = destroy_nat_rules(runner).await {
            error!(error = %e, "failed to destroy NAT rules");
        }

        self.transition(ClusterState::Destroyed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::config::{NetworkSpec, NodeSpec, PodInterfaceSpec, PodSpec};
    use std::net::SocketAddr;

    fn runtime(runner: &RecordingRunner, dir: &Path) -> ClusterRuntime {
        let config = RuntimeConfig {
            data_dir: dir.join("data"),
            cache_dir: dir.join("cache"),
            run_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let bmc = BmcConfig { listen: SocketAddr::from(([127, 0, 0, 1], 0)) };
        ClusterRuntime::new(config, &bmc, Arc::new(runner.clone()))
            .with_capabilities(HostCapabilities::default())
    }

    #[tokio::test]
    async fn setup_creates_the_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = runtime(&RecordingRunner::new(), dir.path());
        runtime.setup().await.unwrap();

        let dirs = runtime.dirs().unwrap();
        for sub in ["volumes", "nvram", "rkt", "temp"] {
            assert!(dir.path().join("data").join(sub).is_dir(), "{sub}");
        }
        assert!(dirs.temp_dir.starts_with(dir.path().join("data/temp")));
        assert!(dirs.temp_dir.is_dir());
        assert!(dir.path().join("cache/image_cache").is_dir());
        assert!(dir.path().join("cache/data_cache").is_dir());
    }

    #[tokio::test]
    async fn data_dir_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data"), b"").unwrap();
        let mut runtime = runtime(&RecordingRunner::new(), dir.path());

        let err = runtime.setup().await.unwrap_err();
        assert!(matches!(err, ClusterError::NotADirectory { .. }));
    }

    #[tokio::test]
    async fn start_requires_setup() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(&RecordingRunner::new(), dir.path());

        let err = runtime
            .start(&Cluster::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotSetUp));
        assert_eq!(runtime.state(), ClusterState::Created);
    }

    #[tokio::test]
    async fn network_failure_aborts_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        runner.fail_when(|c| c.starts_with(&["ip", "link", "add", "broken"]));
        let mut runtime = runtime(&runner, dir.path());
        runtime.setup().await.unwrap();
        let cluster = Cluster {
            networks: vec![
                NetworkSpec { name: "ok".into(), ..Default::default() },
                NetworkSpec { name: "broken".into(), ..Default::default() },
            ],
            nodes: vec![NodeSpec { name: "n".into(), ..Default::default() }],
            ..Default::default()
        };

        let err = runtime.start(&cluster, CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ClusterError::Network(_)));
        assert!(runner.spawned().is_empty());
        assert_eq!(runtime.state(), ClusterState::Created);
    }

    #[tokio::test]
    async fn failing_pod_stops_the_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        runner.exit_spawned_with(3);
        let mut runtime = runtime(&runner, dir.path());
        runtime.setup().await.unwrap();
        let cluster = Cluster {
            networks: vec![NetworkSpec { name: "ext-net".into(), ..Default::default() }],
            pods: vec![PodSpec {
                name: "bird".into(),
                interfaces: vec![PodInterfaceSpec {
                    network: "ext-net".into(),
                    addresses: vec!["10.0.0.5/24".into()],
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        let token = CancellationToken::new();

        let err = runtime.start(&cluster, token.clone()).await.unwrap_err();

        assert!(matches!(err, ClusterError::Pod(_)));
        assert!(!token.is_cancelled(), "the caller's token is left alone");
        assert_eq!(runtime.state(), ClusterState::Stopped);
        assert_eq!(runner.commands_starting_with(&["mount"]).len(), 1);
        assert_eq!(runner.commands_starting_with(&["umount"]).len(), 1);

        runtime.destroy(&cluster).await;
        assert_eq!(runner.commands_starting_with(&["ip", "link", "delete", "pmveth0_"]).len(), 1);
        assert_eq!(runner.commands_starting_with(&["ip", "netns", "del", "pm_bird"]).len(), 1);
        assert_eq!(runtime.state(), ClusterState::Destroyed);
    }
}
