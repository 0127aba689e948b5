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
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("failed to create tap '{tap}' on bridge '{bridge}': {source}")]
    FailedToCreateTap { tap: String, bridge: String, source: CommandError },
    #[error("failed to create veth '{veth}' on bridge '{bridge}': {source}")]
    FailedToCreateVeth { veth: String, bridge: String, source: CommandError },
    #[error("failed to create network namespace for pod '{pod}': {source}")]
    FailedToCreatePodNamespace { pod: String, source: CommandError },
    #[error("init script '{script}' failed in pod '{pod}': {source}")]
    InitScriptFailed { pod: String, script: String, source: CommandError },
    #[error("failed to create NAT rules: {source}")]
    FailedToCreateNatRules { source: CommandError },
    #[error("failed to create network '{network}': {source}")]
    FailedToCreateNetwork { network: String, source: CommandError },
    #[error("network '{network}' has an invalid address '{address}': {reason}")]
    InvalidAddress { network: String, address: String, reason: String },
    #[error(transparent)]
    Command(#[from] CommandError),
}
