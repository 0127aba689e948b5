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

use std::io;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancels `token` on the first SIGTERM or SIGINT.
///
/// Returns early, without cancelling, if `token` is cancelled by someone
/// else. If the signal handlers cannot be installed the error is logged and
/// the token is left alone; the cluster then runs until one of its tasks
/// fails.
pub async fn cancel_on_signal(token: CancellationToken) {
    let result = tokio::select! {
        result = wait_for_sigterm() => result.map(|_| "SIGTERM"),
        result = wait_for_sigint() => result.map(|_| "SIGINT"),
        _ = token.cancelled() => return,
    };

    match result {
        Ok(signal) => {
            info!(signal, "received shutdown signal");
            token.cancel();
        }
        Err(e) => error!(error = %e, "failed to listen for shutdown signals"),
    }
}

pub async fn wait_for_sigterm() -> io::Result<()> {
    let mut stream = tokio::signal::unix::signal(SignalKind::terminate())?;

    let _ = stream.recv().await;
    Ok(())
}

pub async fn wait_for_sigint() -> io::Result<()> {
    let mut stream = tokio::signal::unix::signal(SignalKind::interrupt())?;

    let _ = stream.recv().await;
    Ok(())
}
