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

use super::{PodError, Result};
use crate::command::CommandSpec;
use crate::config::{AppSpec, PodSpec};
use crate::network::pod_namespace;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const RKT_BINARY: &str = "rkt";

/// `rkt fetch` of an app image into the local store.
pub fn fetch_image_command(image: &str) -> CommandSpec {
    CommandSpec::new(
        RKT_BINARY,
        ["--pull-policy=new", "--insecure-options=image", "fetch", image],
    )
}

fn app_args(app: &AppSpec) -> Vec<String> {
    let mut args = vec![app.image.clone(), format!("--name={}", app.name)];
    if app.readonly_rootfs {
        args.push("--readonly-rootfs=true".into());
    }
    if let Some(user) = &app.user {
        args.push(format!("--user={user}"));
    }
    if let Some(group) = &app.group {
        args.push(format!("--group={group}"));
    }
    if let Some(exec) = &app.exec {
        args.push(format!("--exec={exec}"));
    }
    for mount in &app.mount {
        args.push(format!(
            "--mount=volume={},target={}",
            mount.volume, mount.target
        ));
    }
    if !app.args.is_empty() {
        args.push("--".into());
        args.extend(app.args.iter().cloned());
    }
    args
}

/// Arguments of `rkt run` for `pod`. Pod volumes are host directories of
/// the prepared data folders in `folders`.
pub fn rkt_run_args(
    pod: &PodSpec,
    folders: &HashMap<String, PathBuf>,
) -> Result<Vec<String>> {
    let mut args: Vec<String> = [
        "--insecure-options=all-run",
        "run",
        "--net=host",
        "--dns=host",
    ]
    .map(String::from)
    .into();

    for volume in &pod.volumes {
        let source = folders.get(&volume.folder).ok_or_else(|| {
            PodError::UnknownFolder {
                pod: pod.name.clone(),
                volume: volume.name.clone(),
                folder: volume.folder.clone(),
            }
        })?;
        args.push(format!(
            "--volume={},kind=host,source={},readOnly={}",
            volume.name,
            source.display(),
            volume.readonly
        ));
    }

    for (i, app) in pod.apps.iter().enumerate() {
        if i > 0 {
            args.push("---".into());
        }
        args.extend(app_args(app));
    }
    Ok(args)
}

/// Runs rkt inside the pod's namespace, chrooted to `root`.
pub fn rkt_run_command(
    pod: &PodSpec,
    root: &Path,
    folders: &HashMap<String, PathBuf>,
) -> Result<CommandSpec> {
    let mut args = vec![
        "netns".to_string(),
        "exec".into(),
        pod_namespace(&pod.name),
        "chroot".into(),
        root.display().to_string(),
        RKT_BINARY.into(),
    ];
    args.extend(rkt_run_args(pod, folders)?);
    Ok(CommandSpec::new("ip", args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppMountSpec, PodVolumeSpec};
    use pretty_assertions::assert_eq;

    fn pod() -> PodSpec {
        PodSpec {
            name: "bird".into(),
            volumes: vec![PodVolumeSpec {
                name: "config".into(),
                folder: "bird-data".into(),
                readonly: true,
            }],
            apps: vec![
                AppSpec {
                    name: "bird".into(),
                    image: "docker://quay.io/cybozu/bird:2.0".into(),
                    readonly_rootfs: true,
                    mount: vec![AppMountSpec {
                        volume: "config".into(),
                        target: "/etc/bird".into(),
                    }],
                    ..Default::default()
                },
                AppSpec {
                    name: "debug".into(),
                    image: "docker://quay.io/cybozu/ubuntu-debug:18.04".into(),
                    user: Some("0".into()),
                    group: Some("0".into()),
                    exec: Some("/bin/sleep".into()),
                    args: vec!["infinity".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn run_command_joins_namespace_and_root() {
        let folders =
            HashMap::from([("bird-data".to_string(), PathBuf::from("/tmp/f/bird-data"))]);

        let command =
            rkt_run_command(&pod(), Path::new("/tmp/root"), &folders).unwrap();

        assert_eq!(command.program, "ip");
        assert_eq!(
            command.args,
            vec![
                "netns",
                "exec",
                "pm_bird",
                "chroot",
                "/tmp/root",
                "rkt",
                "--insecure-options=all-run",
                "run",
                "--net=host",
                "--dns=host",
                "--volume=config,kind=host,source=/tmp/f/bird-data,readOnly=true",
                "docker://quay.io/cybozu/bird:2.0",
                "--name=bird",
                "--readonly-rootfs=true",
                "--mount=volume=config,target=/etc/bird",
                "---",
                "docker://quay.io/cybozu/ubuntu-debug:18.04",
                "--name=debug",
                "--user=0",
                "--group=0",
                "--exec=/bin/sleep",
                "--",
                "infinity",
            ]
        );
    }

    #[test]
    fn unknown_folder_is_an_error() {
        let err = rkt_run_args(&pod(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, PodError::UnknownFolder { .. }));
    }

    #[test]
    fn fetch_command() {
        assert_eq!(
            fetch_image_command("docker://busybox").to_string(),
            "rkt --pull-policy=new --insecure-options=image fetch docker://busybox"
        );
    }
}
