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

use super::qemu_args::{
    monitor_socket_path, nvram_path, socket_path, NetInterface, QemuArgs,
    OVMF_VARS_PATH,
};
use super::socket_wait::{SocketProbe, SocketState, SocketWait};
use super::{NodeVm, Result, VmError};
use crate::bmc::{BmcServer, BmcSignalInterceptor, PowerControl};
use crate::command::{
    forward_lines, CommandRunner, CommandSpec, OutputMode, ProcessHandle,
    ProcessOutput, SpawnOptions,
};
use crate::config::NodeSpec;
use crate::host::HostCapabilities;
use crate::network::{create_tap, generate_random_mac, NameGenerator};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span};

/// Everything a node needs from the cluster to start its VM.
#[derive(Debug, Clone)]
pub struct NodeRuntime {
    pub runner: Arc<dyn CommandRunner>,
    pub taps: Arc<NameGenerator>,
    pub bmc: Arc<BmcServer>,
    pub probe: Arc<dyn SocketProbe>,
    pub run_dir: PathBuf,
    pub data_dir: PathBuf,
    pub nographic: bool,
    /// Forward the hypervisor's stderr to the log.
    pub debug: bool,
    pub capabilities: HostCapabilities,
}

impl NodeRuntime {
    /// Starts the VM of `node` and supervises it until it exits or `token`
    /// is cancelled. `volume_args` are the drive arguments of the node's
    /// prepared volumes.
    ///
    /// Cancellation is not an error: nothing is started once `token` is
    /// cancelled, a running VM is killed, and `Ok` is returned.
    pub async fn start_node(
        &self,
        node: &NodeSpec,
        volume_args: &[String],
        token: CancellationToken,
    ) -> Result<()> {
        let name = node.name.as_str();
        let interfaces = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(node = name, "cancelled before the VM was started");
                return Ok(());
            }
            interfaces = self.prepare(node) => interfaces?,
        };

        let command = QemuArgs {
            node,
            run_dir: &self.run_dir,
            data_dir: &self.data_dir,
            nographic: self.nographic,
            capabilities: self.capabilities,
            volume_args,
            interfaces: &interfaces,
        }
        .command();

        info!(node = name, "starting VM");
        let stderr =
            if self.debug { OutputMode::Piped } else { OutputMode::Null };
        let options = SpawnOptions { stdout: OutputMode::Piped, stderr };
        let mut process = self.runner.spawn(&command, options).map_err(|e| {
            VmError::FailedToStart { node: name.into(), source: e }
        })?;

        // aborted when the node returns
        let mut pumps = JoinSet::new();
        if let Some(stdout) = process.stdout.take() {
            let interceptor = self.bmc.interceptor(&node.serial());
            let _ = pumps.spawn(intercept(stdout, interceptor));
        }
        if let Some(stderr) = process.stderr.take() {
            let span =
                info_span!("running process", kind = "qemu", node = name);
            let _ = pumps.spawn(forward_lines(stderr, span, "stderr"));
        }

        let monitor = monitor_socket_path(&self.run_dir, name);
        let result = self
            .supervise(node, &monitor, process.handle.as_mut(), &token)
            .await;

        let _ = tokio::fs::remove_file(&monitor).await;
        if self.nographic {
            let console = socket_path(&self.run_dir, name);
            let _ = tokio::fs::remove_file(console).await;
        }
        result
    }

    /// Creates the taps and, for UEFI nodes, the NVRAM image.
    async fn prepare(&self, node: &NodeSpec) -> Result<Vec<NetInterface>> {
        let interfaces = self.allocate_interfaces(node).await?;
        if node.uefi {
            self.ensure_nvram(&node.name).await?;
        }
        Ok(interfaces)
    }

    async fn allocate_interfaces(
        &self,
        node: &NodeSpec,
    ) -> Result<Vec<NetInterface>> {
        let mut interfaces = Vec::with_capacity(node.interfaces.len());
        for bridge in &node.interfaces {
            let tap = self.taps.new_name();
            create_tap(self.runner.as_ref(), &tap, bridge).await?;
            interfaces.push(NetInterface {
                bridge: bridge.clone(),
                tap,
                mac: generate_random_mac(),
            });
        }
        Ok(interfaces)
    }

    /// Copies the UEFI variable store template unless the node has one.
    async fn ensure_nvram(&self, node: &str) -> Result<()> {
        let path = nvram_path(&self.data_dir, node);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(());
        }

        let copy = CommandSpec::new(
            "cp",
            [OVMF_VARS_PATH.to_string(), path.display().to_string()],
        );
        self.runner.run(&copy).await.map_err(|e| {
            error!(node, error = %e, "failed to create nvram");
            VmError::FailedToCreateNvram { node: node.into(), source: e }
        })
    }

    async fn supervise(
        &self,
        node: &NodeSpec,
        monitor: &Path,
        process: &mut dyn ProcessHandle,
        token: &CancellationToken,
    ) -> Result<()> {
        let name = node.name.as_str();
        let control_socket_error = |e| VmError::ControlSocket {
            node: name.into(),
            path: monitor.to_path_buf(),
            source: e,
        };

        let wait = SocketWait::new(monitor, self.probe.clone(), token.clone());
        let state = tokio::select! {
            state = wait.run() => state.map_err(control_socket_error)?,
            status = process.wait() => return exited(name, status),
        };
        if state == SocketState::Canceled {
            info!(node = name, "cancelled before the monitor came up");
            return stop(name, process).await;
        }

        let stream = UnixStream::connect(monitor)
            .await
            .map_err(control_socket_error)?;
        let (mut reader, writer) = stream.into_split();
        let discard = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
        });

        let serial = node.serial();
        let vm: Arc<dyn PowerControl> =
            Arc::new(NodeVm::new(name, Box::new(writer)));
        self.bmc.register_vm(&serial, vm.clone()).await;

        let result = tokio::select! {
            status = process.wait() => exited(name, status),
            _ = token.cancelled() => stop(name, process).await,
        };
        self.bmc.unregister_vm(&serial, &vm).await;
        discard.abort();
        result
    }
}

async fn intercept(
    mut stdout: ProcessOutput,
    mut interceptor: BmcSignalInterceptor,
) {
    let mut buf = [0u8; 4096];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let _ = interceptor.write_all(&buf[..n]);
            }
        }
    }
}

fn exited(node: &str, status: std::io::Result<ExitStatus>) -> Result<()> {
    let status = status.map_err(|e| VmError::FailedToWait {
        node: node.into(),
        source: e,
    })?;
    if status.success() {
        info!(node, "VM exited");
        return Ok(());
    }
    error!(node, %status, "QEMU exited with an error");
    Err(VmError::ExitedWithError { node: node.into(), status })
}

/// Kills the VM after cancellation and reaps it.
async fn stop(node: &str, process: &mut dyn ProcessHandle) -> Result<()> {
    if let Err(e) = process.start_kill() {
        // already gone
        info!(node, error = %e, "could not kill VM");
    }
    let _ = process.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::vms::FsProbe;
    use std::net::SocketAddr;

    fn runtime(runner: &RecordingRunner, dir: &Path) -> NodeRuntime {
        let runner: Arc<dyn CommandRunner> = Arc::new(runner.clone());
        let listen = SocketAddr::from(([127, 0, 0, 1], 0));
        NodeRuntime {
            runner: runner.clone(),
            taps: Arc::new(NameGenerator::new("pmtap")),
            bmc: Arc::new(BmcServer::new(listen, runner)),
            probe: Arc::new(FsProbe),
            run_dir: dir.to_path_buf(),
            data_dir: dir.to_path_buf(),
            nographic: false,
            debug: false,
            capabilities: HostCapabilities::default(),
        }
    }

    fn node() -> NodeSpec {
        NodeSpec {
            name: "boot-0".into(),
            interfaces: vec!["ext-net".into(), "node0".into()],
            cpu: 1,
            memory: Some("1G".into()),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_monitor_appears_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let runtime = runtime(&runner, dir.path());
        let token = CancellationToken::new();

        let node = node();
        let task = {
            let token = token.clone();
            async move { runtime.start_node(&node, &[], token).await }
        };
        let task = tokio::spawn(task);
        tokio::time::sleep(std::time::Duration::from_millis(350)).await;
        token.cancel();

        task.await.unwrap().unwrap();
        assert_eq!(runner.spawned().len(), 1);
        assert_eq!(runner.running(), 0, "the VM must be killed");
    }

    #[tokio::test]
    async fn cancelled_token_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let runtime = runtime(&runner, dir.path());
        let token = CancellationToken::new();
        token.cancel();

        runtime.start_node(&node(), &[], token).await.unwrap();

        assert!(runner.spawned().is_empty());
        assert!(runner.commands_starting_with(&["ip", "tuntap", "add"]).is_empty());
    }

    #[tokio::test]
    async fn exited_vm_is_unregistered_from_the_bmc() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        runner.serve_monitor_sockets();
        let runtime = runtime(&runner, dir.path());
        let bmc = runtime.bmc.clone();
        let serial = node().serial();

        let task = tokio::spawn(async move {
            runtime.start_node(&node(), &[], CancellationToken::new()).await
        });
        for _ in 0..100 {
            if bmc.vm(&serial).await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(bmc.vm(&serial).await.is_some());

        runner.exit_running_with(1);
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, VmError::ExitedWithError { .. }));
        assert!(bmc.vm(&serial).await.is_none());
    }

    #[tokio::test]
    async fn vm_exit_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        runner.serve_monitor_sockets();
        runner.exit_spawned_with(1);
        let runtime = runtime(&runner, dir.path());

        let err = runtime
            .start_node(&node(), &[], CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, VmError::ExitedWithError { .. }));
        assert_eq!(runner.commands_starting_with(&["ip", "tuntap", "add"]).len(), 2);
        assert!(!dir.path().join("boot-0.monitor").exists(), "monitor socket is removed");
    }

    #[tokio::test]
    async fn vm_dying_before_the_monitor_appears_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        runner.exit_spawned_with(1);
        let runtime = runtime(&runner, dir.path());

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            runtime.start_node(&node(), &[], CancellationToken::new()),
        )
        .await
        .expect("does not wait for a socket that never appears")
        .unwrap_err();

        assert!(matches!(err, VmError::ExitedWithError { .. }));
    }

    #[tokio::test]
    async fn monitor_file_without_a_listener_is_a_control_socket_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("boot-0.monitor"), b"").unwrap();
        let runner = RecordingRunner::new();
        let runtime = runtime(&runner, dir.path());

        let err = runtime
            .start_node(&node(), &[], CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, VmError::ControlSocket { .. }));
        assert!(runtime.bmc.vm(&node().serial()).await.is_none());
    }

    #[tokio::test]
    async fn tap_failure_prevents_launch() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        runner.fail_when(|c| c.starts_with(&["ip", "tuntap", "add", "pmtap1"]));
        let runtime = runtime(&runner, dir.path());

        let err = runtime
            .start_node(&node(), &[], CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, VmError::Network(_)));
        assert!(runner.spawned().is_empty());
        assert_eq!(runtime.taps.generated_names(), vec!["pmtap0", "pmtap1"]);
    }

    #[tokio::test]
    async fn uefi_node_gets_an_nvram_copy_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nvram")).unwrap();
        let runner = RecordingRunner::new();
        let runtime = runtime(&runner, dir.path());

        runtime.ensure_nvram("boot-0").await.unwrap();
        std::fs::write(dir.path().join("nvram/boot-0.fd"), b"vars").unwrap();
        runtime.ensure_nvram("boot-0").await.unwrap();

        let copies = runner.commands_starting_with(&["cp"]);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].args[0], OVMF_VARS_PATH);
    }
}
