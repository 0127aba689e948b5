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

use super::rkt_args::{fetch_image_command, rkt_run_command};
use super::{PodError, Result};
use crate::command::{
    forward_lines, CommandRunner, OutputMode, ProcessHandle, SpawnOptions,
};
use crate::config::PodSpec;
use crate::network::{
    create_veth, make_pod_ns, run_in_pod_ns, NameGenerator,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

/// Everything a pod needs from the cluster to start.
#[derive(Debug, Clone)]
pub struct PodRuntime {
    pub runner: Arc<dyn CommandRunner>,
    pub veths: Arc<NameGenerator>,
    /// Host directories of the prepared data folders, by folder name.
    pub folders: Arc<HashMap<String, PathBuf>>,
}

impl PodRuntime {
    /// Fetches the images of every app of `pod`.
    pub async fn prepare_pod(&self, pod: &PodSpec) -> Result<()> {
        for app in &pod.apps {
            info!(pod = %pod.name, image = %app.image, "fetching image");
            self.runner
                .run(&fetch_image_command(&app.image))
                .await
                .map_err(|e| PodError::FailedToFetchImage {
                    image: app.image.clone(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Builds the pod's namespace, runs its init scripts and then runs rkt
    /// chrooted to `root` until it exits or `token` is cancelled.
    ///
    /// On cancellation rkt receives SIGTERM and the pod returns `Ok` once it
    /// has exited. Nothing is started if `token` is already cancelled.
    pub async fn start_pod(
        &self,
        pod: &PodSpec,
        root: &Path,
        token: CancellationToken,
    ) -> Result<()> {
        let name = pod.name.as_str();
        let runner = self.runner.as_ref();

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(pod = name, "cancelled before the pod was started");
                return Ok(());
            }
            provisioned = self.provision(pod) => provisioned?,
        }

        let command = rkt_run_command(pod, root, &self.folders)?;
        info!(pod = name, %command, "rkt run");
        let options = SpawnOptions {
            stdout: OutputMode::Piped,
            stderr: OutputMode::Piped,
        };
        let mut process = runner.spawn(&command, options).map_err(|e| {
            error!(pod = name, error = %e, "failed to start rkt");
            PodError::FailedToStart { pod: name.into(), source: e }
        })?;

        let mut pumps = JoinSet::new();
        let outputs = [
            ("stdout", process.stdout.take()),
            ("stderr", process.stderr.take()),
        ];
        for (stream, output) in outputs {
            if let Some(output) = output {
                let span =
                    info_span!("running process", kind = "rkt", pod = name);
                let _ = pumps.spawn(forward_lines(output, span, stream));
            }
        }

        let handle = process.handle.as_mut();
        tokio::select! {
            status = handle.wait() => {
                let status = status.map_err(|e| PodError::FailedToWait {
                    pod: name.into(),
                    source: e,
                })?;
                // drain the remaining output
                while pumps.join_next().await.is_some() {}
                if status.success() {
                    info!(pod = name, "pod exited");
                    return Ok(());
                }
                error!(pod = name, %status, "rkt exited with an error");
                Err(PodError::ExitedWithError { pod: name.into(), status })
            }
            _ = token.cancelled() => terminate(name, handle).await,
        }
    }

    /// Creates the veths and the pod namespace, then runs the init scripts
    /// inside it.
    async fn provision(&self, pod: &PodSpec) -> Result<()> {
        let name = pod.name.as_str();
        let runner = self.runner.as_ref();

        let mut veths = Vec::with_capacity(pod.interfaces.len());
        let mut addresses = HashMap::new();
        for interface in &pod.interfaces {
            let veth = self.veths.new_name();
            create_veth(runner, &veth, &interface.network).await?;
            let _ = addresses.insert(veth.clone(), interface.addresses.clone());
            veths.push(veth);
        }

        make_pod_ns(runner, name, &veths, &addresses).await?;
        for script in &pod.init_scripts {
            let script = script.display().to_string();
            info!(pod = name, %script, "running init script");
            run_in_pod_ns(runner, name, &script).await?;
        }
        Ok(())
    }
}

async fn terminate(pod: &str, process: &mut dyn ProcessHandle) -> Result<()> {
    info!(pod, "terminating pod");
    if let Err(e) = process.terminate() {
        warn!(pod, error = %e, "failed to send SIGTERM");
    }
    let _ = process.wait().await;
    Ok(())
}
