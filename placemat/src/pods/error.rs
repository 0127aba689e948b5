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

use crate::command::CommandError;
use crate::network::NetworkError;
use std::io;
use std::process::ExitStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PodError>;

#[derive(Debug, Error)]
pub enum PodError {
    #[error("image '{image}' could not be fetched: {source}")]
    FailedToFetchImage { image: String, source: CommandError },
    #[error(
        "pod '{pod}' volume '{volume}' refers to unknown data folder '{folder}'"
    )]
    UnknownFolder { pod: String, volume: String, folder: String },
    #[error("pod '{pod}' could not be started: {source}")]
    FailedToStart { pod: String, source: CommandError },
    #[error("pod '{pod}' failed while waiting for exit: {source}")]
    FailedToWait { pod: String, source: io::Error },
    #[error("pod '{pod}' exited with {status}")]
    ExitedWithError { pod: String, status: ExitStatus },
    #[error(transparent)]
    Network(#[from] NetworkError),
}
