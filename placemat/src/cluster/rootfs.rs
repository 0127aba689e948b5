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

use super::{ClusterError, Result};
use crate::command::{CommandRunner, CommandSpec};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// An overlay of the host's `/` that pods are chrooted into, so that
/// changes made by the pod runtime stay out of the host filesystem.
#[derive(Debug)]
pub struct Rootfs {
    base: PathBuf,
}

impl Rootfs {
    fn merged(base: &Path) -> PathBuf {
        base.join("merged")
    }

    pub fn mount_command(base: &Path) -> CommandSpec {
        let options = format!(
            "lowerdir=/,upperdir={},workdir={}",
            base.join("upper").display(),
            base.join("work").display()
        );
        CommandSpec::new(
            "mount",
            [
                "-t".to_string(),
                "overlay".into(),
                "overlay".into(),
                "-o".into(),
                options,
                Self::merged(base).display().to_string(),
            ],
        )
    }

    /// Mounts a fresh overlay under `base`.
    pub async fn stage(
        runner: &dyn CommandRunner,
        base: &Path,
    ) -> Result<Self> {
        for dir in ["upper", "work", "merged"] {
            let path = base.join(dir);
            tokio::fs::create_dir_all(&path).await.map_err(|e| {
                ClusterError::FailedToCreateDirectory { path, source: e }
            })?;
        }

        runner
            .run(&Self::mount_command(base))
            .await
            .map_err(|e| ClusterError::FailedToStageRootfs { source: e })?;
        let merged = Self::merged(base);
        info!(path = %merged.display(), "staged pod root filesystem");
        Ok(Self { base: base.to_path_buf() })
    }

    pub fn path(&self) -> PathBuf {
        Self::merged(&self.base)
    }

    /// Unmounts the overlay. Failures are logged.
    pub async fn destroy(self, runner: &dyn CommandRunner) {
        let path = self.path();
        let umount = CommandSpec::new("umount", [path.display().to_string()]);
        if let Err(e) = runner.run(&umount).await {
            error!(
                path = %path.display(),
                error = %e,
                "failed to unmount pod root filesystem"
            );
        }
    }
}
