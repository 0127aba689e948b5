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
use crate::config::DataFolderSpec;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Host directory of the data folder `name` for the run using `temp_dir`.
pub fn data_folder_path(temp_dir: &Path, name: &str) -> PathBuf {
    temp_dir.join("folders").join(name)
}

/// Gathers the files of `spec` into its directory under `temp_dir`. Files
/// with a url are taken from `cache`.
pub async fn prepare_data_folder(
    spec: &DataFolderSpec,
    temp_dir: &Path,
    cache: &Cache,
) -> Result<PathBuf> {
    info!(folder = %spec.name, "initializing data folder");
    let dir = data_folder_path(temp_dir, &spec.name);
    let io_error = |e| ClusterError::FailedToPrepareDataFolder {
        folder: spec.name.clone(),
        source: e,
    };
    tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;

    for file in &spec.files {
        let source = match (&file.file, &file.url) {
            (Some(path), _) => path.clone(),
            (None, Some(url)) => {
                if !cache.contains(url) {
                    return Err(ClusterError::NotCached {
                        url: url.clone(),
                        cache: cache.dir().to_path_buf(),
                    });
                }
                cache.path_for(url)
            }
            (None, None) => {
                return Err(ClusterError::DataFileWithoutSource {
                    folder: spec.name.clone(),
                    file: file.name.clone(),
                })
            }
        };

        let target = dir.join(&file.name);
        debug!(
            source = %source.display(),
            target = %target.display(),
            "copying data file"
        );
        let _ = tokio::fs::copy(&source, &target).await.map_err(io_error)?;
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataFileSpec;

    #[tokio::test]
    async fn copies_local_and_cached_files() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Cache::new(temp.path());
        let local = temp.path().join("local.txt");
        std::fs::write(&local, b"local").unwrap();
        let url = "https://example.com/remote.txt";
        std::fs::write(cache.path_for(url), b"remote").unwrap();

        let spec = DataFolderSpec {
            name: "data".into(),
            files: vec![
                DataFileSpec { name: "a".into(), file: Some(local), url: None },
                DataFileSpec { name: "b".into(), file: None, url: Some(url.into()) },
            ],
        };
        let dir = prepare_data_folder(&spec, temp.path(), &cache).await.unwrap();

        assert_eq!(dir, temp.path().join("folders/data"));
        assert_eq!(std::fs::read(dir.join("a")).unwrap(), b"local");
        assert_eq!(std::fs::read(dir.join("b")).unwrap(), b"remote");
    }

    #[tokio::test]
    async fn missing_cache_entry_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Cache::new(temp.path());
        let spec = DataFolderSpec {
            name: "data".into(),
            files: vec![DataFileSpec {
                name: "b".into(),
                file: None,
                url: Some("https://example.com/missing".into()),
            }],
        };

        let err = prepare_data_folder(&spec, temp.path(), &cache).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotCached { .. }));
    }
}
