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

//! QEMU backed nodes.

pub use self::{
    error::VmError,
    node::NodeRuntime,
    qemu_args::{
        monitor_socket_path, nvram_path, socket_path, NetInterface, QemuArgs,
        OVMF_CODE_PATH, OVMF_VARS_PATH, QEMU_BINARY, REBOOT_TIMEOUT,
    },
    socket_wait::{FsProbe, SocketProbe, SocketState, SocketWait, POLL_INTERVAL},
    vm_handle::{NodeVm, POWER_OFF_COMMAND, POWER_ON_COMMAND},
};

mod error;
mod node;
mod qemu_args;
mod socket_wait;
mod vm_handle;

pub use self::error::Result;
