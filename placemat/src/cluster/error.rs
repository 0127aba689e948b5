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

use crate::bmc::BmcError;
use crate::command::CommandError;
use crate::network::NetworkError;
use crate::pods::PodError;
use crate::vms::VmError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("'{path}' is not a directory")]
    NotADirectory { path: PathBuf },
    #[error("failed to create directory '{path}': {source}")]
    FailedToCreateDirectory { path: PathBuf, source: io::Error },
    #[error("runtime directories are not set up")]
    NotSetUp,
    #[error("cluster was already started")]
    AlreadyStarted,
    #[error("image '{image}' has neither a file nor a url")]
    ImageWithoutSource { image: String },
    #[error("'{url}' is not in the cache '{cache}'")]
    NotCached { url: String, cache: PathBuf },
    #[error(
        "node '{node}' volume '{volume}' refers to unknown image '{image}'"
    )]
    UnknownImage { node: String, volume: String, image: String },
    #[error("'{owner}' refers to unknown data folder '{folder}'")]
    UnknownFolder { owner: String, folder: String },
    #[error(
        "data file '{file}' of folder '{folder}' has neither a file nor a url"
    )]
    DataFileWithoutSource { folder: String, file: String },
    #[error("failed to prepare data folder '{folder}': {source}")]
    FailedToPrepareDataFolder { folder: String, source: io::Error },
    #[error("node '{node}' volume '{volume}' could not be created: {source}")]
    FailedToCreateVolume { node: String, volume: String, source: CommandError },
    #[error("failed to stage the pod root filesystem: {source}")]
    FailedToStageRootfs { source: CommandError },
    #[error("task '{task}' panicked")]
    TaskPanicked { task: String },
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Bmc(#[from] BmcError),
    #[error(transparent)]
    Vm(#[from] VmError),
    #[error(transparent)]
    Pod(#[from] PodError),
}
