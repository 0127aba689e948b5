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

use super::{Cache, ClusterError, Result};
use crate::command::{self, CommandRunner, CommandSpec};
use crate::config::{ImageSpec, NodeSpec, VolumeSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A disk attached to a node.
#[async_trait]
pub trait Volume: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Creates the backing storage under `base_dir`, unless it already
    /// exists, and returns the hypervisor arguments attaching it.
    async fn create(
        &self,
        runner: &dyn CommandRunner,
        base_dir: &Path,
    ) -> command::Result<Vec<String>>;
}

fn volume_path(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(format!("{name}.img"))
}

fn drive_args(path: &Path) -> Vec<String> {
    vec![
        "-drive".into(),
        format!(
            "if=virtio,cache=none,aio=native,format=qcow2,file={}",
            path.display()
        ),
    ]
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// A copy-on-write overlay on top of a base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageVolume {
    pub name: String,
    pub base: PathBuf,
    pub base_format: String,
}

#[async_trait]
impl Volume for ImageVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(
        &self,
        runner: &dyn CommandRunner,
        base_dir: &Path,
    ) -> command::Result<Vec<String>> {
        let path = volume_path(base_dir, &self.name);
        if exists(&path).await {
            debug!(volume = %self.name, "reusing existing volume");
        } else {
            runner
                .run(&CommandSpec::new(
                    "qemu-img",
                    [
                        "create".to_string(),
                        "-f".into(),
                        "qcow2".into(),
                        "-F".into(),
                        self.base_format.clone(),
                        "-b".into(),
                        self.base.display().to_string(),
                        path.display().to_string(),
                    ],
                ))
                .await?;
        }
        Ok(drive_args(&path))
    }
}

/// An empty disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawVolume {
    pub name: String,
    pub size: String,
}

#[async_trait]
impl Volume for RawVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(
        &self,
        runner: &dyn CommandRunner,
        base_dir: &Path,
    ) -> command::Result<Vec<String>> {
        let path = volume_path(base_dir, &self.name);
        if exists(&path).await {
            debug!(volume = %self.name, "reusing existing volume");
        } else {
            runner
                .run(&CommandSpec::new(
                    "qemu-img",
                    [
                        "create".to_string(),
                        "-f".into(),
                        "qcow2".into(),
                        path.display().to_string(),
                        self.size.clone(),
                    ],
                ))
                .await?;
        }
        Ok(drive_args(&path))
    }
}

/// A host directory exposed as a read-only FAT drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VvfatVolume {
    pub name: String,
    pub folder: PathBuf,
}

#[async_trait]
impl Volume for VvfatVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(
        &self,
        _: &dyn CommandRunner,
        _: &Path,
    ) -> command::Result<Vec<String>> {
        Ok(vec![
            "-drive".into(),
            format!(
                "file=fat:16:{},format=raw,if=virtio",
                self.folder.display()
            ),
        ])
    }
}

/// Location and format of every image, resolved against the image cache.
pub fn resolve_images(
    images: &[ImageSpec],
    cache: &Cache,
) -> Result<HashMap<String, (PathBuf, String)>> {
    images
        .iter()
        .map(|image| {
            let path = match (&image.file, &image.url) {
                (Some(file), _) => file.clone(),
                (None, Some(url)) if cache.contains(url) => cache.path_for(url),
                (None, Some(url)) => {
                    return Err(ClusterError::NotCached {
                        url: url.clone(),
                        cache: cache.dir().to_path_buf(),
                    })
                }
                (None, None) => {
                    return Err(ClusterError::ImageWithoutSource {
                        image: image.name.clone(),
                    })
                }
            };
            Ok((image.name.clone(), (path, image.format.clone())))
        })
        .collect()
}

/// Turns the volume declarations of `node` into [Volume]s.
pub fn node_volumes(
    node: &NodeSpec,
    images: &HashMap<String, (PathBuf, String)>,
    folders: &HashMap<String, PathBuf>,
) -> Result<Vec<Box<dyn Volume>>> {
    node.volumes
        .iter()
        .map(|spec| -> Result<Box<dyn Volume>> {
            let volume: Box<dyn Volume> = match spec {
                VolumeSpec::Image { name, image } => {
                    let (base, base_format) =
                        images.get(image).cloned().ok_or_else(|| {
                            ClusterError::UnknownImage {
                                node: node.name.clone(),
                                volume: name.clone(),
                                image: image.clone(),
                            }
                        })?;
                    Box::new(ImageVolume {
                        name: name.clone(),
                        base,
                        base_format,
                    })
                }
                VolumeSpec::Raw { name, size } => {
                    Box::new(RawVolume {
                        name: name.clone(),
                        size: size.clone(),
                    })
                }
                VolumeSpec::Vvfat { name, folder } => {
                    let folder = folders.get(folder).cloned().ok_or_else(|| {
                        ClusterError::UnknownFolder {
                            owner: node.name.clone(),
                            folder: folder.clone(),
                        }
                    })?;
                    Box::new(VvfatVolume { name: name.clone(), folder })
                }
            };
            Ok(volume)
        })
        .collect()
}

/// Creates every volume of `node` under `volumes_dir/<node>` and returns
/// their combined hypervisor arguments.
pub async fn prepare_node_volumes(
    runner: &dyn CommandRunner,
    node: &NodeSpec,
    volumes: &[Box<dyn Volume>],
    volumes_dir: &Path,
) -> Result<Vec<String>> {
    let base_dir = volumes_dir.join(&node.name);
    tokio::fs::create_dir_all(&base_dir).await.map_err(|e| {
        ClusterError::FailedToCreateDirectory {
            path: base_dir.clone(),
            source: e,
        }
    })?;

    let mut args = Vec::new();
    for volume in volumes {
        info!(node = %node.name, volume = volume.name(), "creating volume");
        let volume_args =
            volume.create(runner, &base_dir).await.map_err(|e| {
                ClusterError::FailedToCreateVolume {
                    node: node.name.clone(),
                    volume: volume.name().into(),
                    source: e,
                }
            })?;
        args.extend(volume_args);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;
    use pretty_assertions::assert_eq;

    fn node() -> NodeSpec {
        NodeSpec {
            name: "boot-0".into(),
            volumes: vec![
                VolumeSpec::Image { name: "root".into(), image: "ubuntu".into() },
                VolumeSpec::Raw { name: "data".into(), size: "10G".into() },
                VolumeSpec::Vvfat { name: "seed".into(), folder: "sabakan".into() },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn volumes_are_created_once_and_attached_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let images = HashMap::from([(
            "ubuntu".to_string(),
            (PathBuf::from("/images/ubuntu.img"), "qcow2".to_string()),
        )]);
        let folders =
            HashMap::from([("sabakan".to_string(), PathBuf::from("/tmp/folders/sabakan"))]);
        let node = node();
        let volumes = node_volumes(&node, &images, &folders).unwrap();

        let args = prepare_node_volumes(&runner, &node, &volumes, dir.path())
            .await
            .unwrap();

        let base = dir.path().join("boot-0");
        let root = base.join("root.img");
        let data = base.join("data.img");
        assert_eq!(
            args,
            vec![
                "-drive".to_string(),
                format!("if=virtio,cache=none,aio=native,format=qcow2,file={}", root.display()),
                "-drive".into(),
                format!("if=virtio,cache=none,aio=native,format=qcow2,file={}", data.display()),
                "-drive".into(),
                "file=fat:16:/tmp/folders/sabakan,format=raw,if=virtio".into(),
            ]
        );
        assert_eq!(
            runner.commands()[0].to_string(),
            format!("qemu-img create -f qcow2 -F qcow2 -b /images/ubuntu.img {}", root.display())
        );
        assert_eq!(runner.commands().len(), 2);

        // existing files are reused
        std::fs::write(&root, b"").unwrap();
        std::fs::write(&data, b"").unwrap();
        let _ = prepare_node_volumes(&runner, &node, &volumes, dir.path())
            .await
            .unwrap();
        assert_eq!(runner.commands().len(), 2);
    }

    #[test]
    fn unknown_image_is_rejected() {
        let err = node_volumes(&node(), &HashMap::new(), &HashMap::new()).unwrap_err();
        assert!(matches!(err, ClusterError::UnknownImage { .. }));
    }

    #[test]
    fn images_resolve_through_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path());
        let url = "https://example.com/ubuntu.img";
        std::fs::write(cache.path_for(url), b"").unwrap();
        let images = vec![
            ImageSpec {
                name: "cached".into(),
                url: Some(url.into()),
                format: "qcow2".into(),
                ..Default::default()
            },
            ImageSpec {
                name: "local".into(),
                file: Some("/images/local.raw".into()),
                format: "raw".into(),
                ..Default::default()
            },
        ];

        let resolved = resolve_images(&images, &cache).unwrap();
        assert_eq!(resolved["cached"].0, cache.path_for(url));
        assert_eq!(resolved["local"], (PathBuf::from("/images/local.raw"), "raw".to_string()));

        let missing = ImageSpec {
            name: "missing".into(),
            url: Some("https://example.com/nope".into()),
            ..Default::default()
        };
        assert!(matches!(
            resolve_images(&[missing], &cache),
            Err(ClusterError::NotCached { .. })
        ));
    }
}
