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
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmError>;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("vm '{node}' could not create its NVRAM: {source}")]
    FailedToCreateNvram { node: String, source: CommandError },
    #[error("vm '{node}' could not be started: {source}")]
    FailedToStart { node: String, source: CommandError },
    #[error("vm '{node}' control socket '{path}' is unusable: {source}")]
    ControlSocket { node: String, path: PathBuf, source: io::Error },
    #[error("vm '{node}' failed while waiting for exit: {source}")]
    FailedToWait { node: String, source: io::Error },
    #[error("vm '{node}' exited with {status}")]
    ExitedWithError { node: String, status: ExitStatus },
    #[error(transparent)]
    Network(#[from] NetworkError),
}
