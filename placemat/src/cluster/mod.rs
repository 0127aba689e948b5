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

//! Lifecycle of an emulated cluster.
//!
//! [ClusterRuntime] walks through [ClusterState]: it creates NAT rules and
//! bridges, prepares data folders, volumes and pod images, then runs every
//! node and pod under one [Supervisor] until cancellation or the first
//! failure. [ClusterRuntime::destroy] releases everything, logging failures
//! instead of returning them.

pub use self::{
    cache::Cache,
    data_folder::{data_folder_path, prepare_data_folder},
    error::{ClusterError, Result},
    rootfs::Rootfs,
    runtime::{ClusterRuntime, ClusterState, RuntimeDirs},
    supervisor::Supervisor,
    volume::{
        node_volumes, prepare_node_volumes, resolve_images, ImageVolume,
        RawVolume, Volume, VvfatVolume,
    },
};

mod cache;
mod data_folder;
mod error;
mod rootfs;
mod runtime;
mod supervisor;
mod volume;
