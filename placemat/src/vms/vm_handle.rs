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

use crate::bmc::PowerControl;
use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Monitor commands resetting and resuming the guest.
pub const POWER_ON_COMMAND: &str = "system_reset\ncont\n";
/// Monitor command pausing the guest.
pub const POWER_OFF_COMMAND: &str = "stop\n";

pub type MonitorWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Monitor {
    writer: MonitorWriter,
    running: bool,
}

/// A running VM, controlled through the write half of its monitor socket.
///
/// Commands are fire and forget. A failed write is logged; a broken monitor
/// surfaces through the exit of the VM process.
pub struct NodeVm {
    name: String,
    monitor: Mutex<Monitor>,
}

impl fmt::Debug for NodeVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeVm").field("name", &self.name).finish()
    }
}

impl NodeVm {
    /// The guest is running when its monitor becomes reachable.
    pub fn new(name: impl Into<String>, writer: MonitorWriter) -> Self {
        Self {
            name: name.into(),
            monitor: Mutex::new(Monitor { writer, running: true }),
        }
    }

    async fn send(&self, monitor: &mut Monitor, command: &str) {
        let result = async {
            monitor.writer.write_all(command.as_bytes()).await?;
            monitor.writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(node = %self.name, error = %e, "failed to write to monitor");
        }
    }
}

#[async_trait]
impl PowerControl for NodeVm {
    async fn power_on(&self) {
        let mut monitor = self.monitor.lock().await;
        if monitor.running {
            return;
        }
        info!(node = %self.name, "power on");
        self.send(&mut monitor, POWER_ON_COMMAND).await;
        monitor.running = true;
    }

    async fn power_off(&self) {
        let mut monitor = self.monitor.lock().await;
        if !monitor.running {
            return;
        }
        info!(node = %self.name, "power off");
        self.send(&mut monitor, POWER_OFF_COMMAND).await;
        monitor.running = false;
    }

    async fn is_running(&self) -> bool {
        self.monitor.lock().await.running
    }
}
