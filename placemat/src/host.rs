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

//! Host capabilities probed once at startup.

use tracing::{debug, warn};

const VHOST_NET_MODULE: &str = "vhost_net";

/// Features of the host kernel the runtime may take advantage of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    /// `vhost_net` is loaded, so tap backends can offload to the kernel.
    pub vhost_net: bool,
}

impl HostCapabilities {
    /// Reads the loaded kernel modules. A host whose module list cannot be
    /// read is treated as having no optional capabilities.
    pub fn probe() -> Self {
        let vhost_net = match procfs::modules() {
            Ok(modules) => modules.contains_key(VHOST_NET_MODULE),
            Err(e) => {
                warn!(error = %e, "failed to read loaded kernel modules");
                false
            }
        };
        let capabilities = Self { vhost_net };
        debug!(?capabilities, "probed host");
        capabilities
    }
}
