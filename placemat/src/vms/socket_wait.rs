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
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Answers whether a socket file exists.
pub trait SocketProbe: Send + Sync + std::fmt::Debug {
    fn exists(&self, path: &Path) -> io::Result<bool>;
}

/// Looks at the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl SocketProbe for FsProbe {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        match std::fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    WaitingForSocket,
    /// The socket file exists. Nothing has connected to it yet; the node
    /// runtime connects right after the wait ends in this state.
    Present,
    Canceled,
}

/// Waits for a control socket to appear, polling every [POLL_INTERVAL]
/// until it does or `token` is cancelled.
#[derive(Debug)]
pub struct SocketWait {
    path: PathBuf,
    probe: Arc<dyn SocketProbe>,
    token: CancellationToken,
    state: SocketState,
}

impl SocketWait {
    pub fn new(
        path: impl Into<PathBuf>,
        probe: Arc<dyn SocketProbe>,
        token: CancellationToken,
    ) -> Self {
        Self {
            path: path.into(),
            probe,
            token,
            state: SocketState::WaitingForSocket,
        }
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Advances by one probe. Terminal states are returned unchanged.
    pub async fn step(&mut self) -> io::Result<SocketState> {
        if self.state != SocketState::WaitingForSocket {
            return Ok(self.state);
        }

        if self.probe.exists(&self.path)? {
            self.state = SocketState::Present;
            return Ok(self.state);
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => self.state = SocketState::Canceled,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        Ok(self.state)
    }

    /// Drives the wait to a terminal state.
    pub async fn run(mut self) -> io::Result<SocketState> {
        loop {
            match self.step().await? {
                SocketState::WaitingForSocket => continue,
                terminal => return Ok(terminal),
            }
        }
    }
}
