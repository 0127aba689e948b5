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

//! Emulated baseboard management controllers.
//!
//! A guest announces the address of its BMC by printing it as the first line
//! on its serial console. The [BmcSignalInterceptor] attached to the VM's
//! stdout turns that line into a [BmcInfo], which the [BmcServer] uses to
//! route power-control requests to the VM registered under the same serial.

pub use self::{
    error::BmcError,
    interceptor::{BmcSignalInterceptor, MAX_BUFFER_SIZE},
    protocol::{PowerCommand, PowerRequest, PowerResponse},
    server::BmcServer,
};
use async_trait::async_trait;
use std::fmt::Debug;

mod error;
mod interceptor;
mod protocol;
mod server;

pub type Result<T> = std::result::Result<T, BmcError>;

/// Capacity of the queue between interceptors and the server.
pub const BMC_INFO_QUEUE_SIZE: usize = 64;

/// The BMC address announced by the guest with the given serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmcInfo {
    pub serial: String,
    pub address: String,
}

/// Power state control of a running machine.
#[async_trait]
pub trait PowerControl: Send + Sync + Debug {
    async fn power_on(&self);
    async fn power_off(&self);
    /// Last commanded state, not the verified state of the guest.
    async fn is_running(&self) -> bool;
}
