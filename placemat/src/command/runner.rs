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

use super::{CommandError, CommandSpec, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::{debug, error};

/// A byte stream produced by a spawned process (stdout or stderr).
pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Where the standard output streams of a spawned process go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    #[default]
    Null,
    Piped,
    Inherit,
}

impl From<OutputMode> for Stdio {
    fn from(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Null => Stdio::null(),
            OutputMode::Piped => Stdio::piped(),
            OutputMode::Inherit => Stdio::inherit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOptions {
    pub stdout: OutputMode,
    pub stderr: OutputMode,
}

/// Handle on a long running child process.
#[async_trait]
pub trait ProcessHandle: Send + fmt::Debug {
    fn id(&self) -> Option<u32>;

    /// Waits for the process to exit.
    async fn wait(&mut self) -> io::Result<ExitStatus>;

    /// Sends SIGKILL without waiting for the exit.
    fn start_kill(&mut self) -> io::Result<()>;

    /// Sends SIGTERM, asking the process to shut down gracefully.
    fn terminate(&self) -> io::Result<()>;
}

/// A started process together with the streams requested as
/// [OutputMode::Piped].
pub struct SpawnedProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub stdout: Option<ProcessOutput>,
    pub stderr: Option<ProcessOutput>,
}

impl fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("handle", &self.handle)
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Seam between orchestration logic and the operating system.
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Runs a short lived command to completion. The exit code is the only
    /// success signal.
    async fn run(&self, command: &CommandSpec) -> Result<()>;

    /// Starts a long running process.
    fn spawn(
        &self,
        command: &CommandSpec,
        options: SpawnOptions,
    ) -> Result<SpawnedProcess>;
}

/// Runs commands on the host with [tokio::process].
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCommandRunner;

impl HostCommandRunner {
    fn command(spec: &CommandSpec) -> Command {
        let mut command = Command::new(&spec.program);
        let _ =
            command.args(&spec.args).stdin(Stdio::null()).kill_on_drop(true);
        command
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<()> {
        debug!(command = %spec, "exec");
        let output = Self::command(spec).output().await.map_err(|e| {
            CommandError::FailedToSpawn { command: spec.to_string(), source: e }
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        error!(
            command = %spec,
            status = %output.status,
            %stderr,
            "command failed"
        );
        Err(CommandError::NonZeroExit {
            command: spec.to_string(),
            status: output.status,
            stderr,
        })
    }

    fn spawn(
        &self,
        spec: &CommandSpec,
        options: SpawnOptions,
    ) -> Result<SpawnedProcess> {
        debug!(command = %spec, "spawn");
        let mut child = Self::command(spec)
            .stdout(options.stdout)
            .stderr(options.stderr)
            .spawn()
            .map_err(|e| CommandError::FailedToSpawn {
                command: spec.to_string(),
                source: e,
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as ProcessOutput);
        let stderr = child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as ProcessOutput);

        Ok(SpawnedProcess {
            handle: Box::new(HostProcess { command: spec.to_string(), child }),
            stdout,
            stderr,
        })
    }
}

#[derive(Debug)]
struct HostProcess {
    command: String,
    child: Child,
}

#[async_trait]
impl ProcessHandle for HostProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn terminate(&self) -> io::Result<()> {
        // None once the child has been reaped
        let Some(id) = self.child.id() else {
            return Ok(());
        };
        debug!(command = %self.command, pid = id, "sending SIGTERM");
        kill(Pid::from_raw(id as i32), Signal::SIGTERM).map_err(io::Error::from)
    }
}
