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

//! Test doubles for the [CommandRunner] seam.
//!
//! [RecordingRunner] never touches the host network stack. It records every
//! command it is asked to run or spawn, fails the commands selected with
//! [RecordingRunner::fail_when], and hands out [FakeProcess]es which stay
//! alive until they are killed or terminated.

use super::{
    CommandError, CommandRunner, CommandSpec, OutputMode, ProcessHandle,
    ProcessOutput, Result, SpawnOptions, SpawnedProcess,
};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::os::unix::net::UnixListener;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

type Predicate = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;
type ExitSender = watch::Sender<Option<ExitStatus>>;

#[derive(Default)]
struct Recorded {
    commands: Vec<CommandSpec>,
    spawned: Vec<CommandSpec>,
    failing: Vec<Predicate>,
    serve_monitor: bool,
    stdout: Option<Vec<u8>>,
    exit_code: Option<i32>,
    monitors: Vec<(PathBuf, UnixListener)>,
    processes: Vec<Arc<ExitSender>>,
}

/// Records commands instead of executing them.
#[derive(Clone, Default)]
pub struct RecordingRunner {
    inner: Arc<Mutex<Recorded>>,
}

impl fmt::Debug for RecordingRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let recorded = self.lock();
        f.debug_struct("RecordingRunner")
            .field("commands", &recorded.commands.len())
            .field("spawned", &recorded.spawned.len())
            .finish()
    }
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every command matching `predicate` exit with status 1.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
    {
        self.lock().failing.push(Box::new(predicate));
    }

    /// Binds a unix listener at the path of any `-monitor unix:PATH,...`
    /// argument of a spawned process, standing in for a hypervisor's
    /// control socket.
    pub fn serve_monitor_sockets(&self) {
        self.lock().serve_monitor = true;
    }

    /// Spawned processes write `bytes` to their stdout.
    pub fn spawn_stdout(&self, bytes: impl Into<Vec<u8>>) {
        self.lock().stdout = Some(bytes.into());
    }

    /// Spawned processes exit on their own with `code`.
    pub fn exit_spawned_with(&self, code: i32) {
        self.lock().exit_code = Some(code);
    }

    /// Processes still running exit with `code`, as if they had died on
    /// their own.
    pub fn exit_running_with(&self, code: i32) {
        let status = ExitStatus::from_raw(code << 8);
        for process in &self.lock().processes {
            exit_once(process, status);
        }
    }

    /// Commands run to completion, in order.
    pub fn commands(&self) -> Vec<CommandSpec> {
        self.lock().commands.clone()
    }

    /// Commands run to completion whose leading words equal `prefix`.
    pub fn commands_starting_with(&self, prefix: &[&str]) -> Vec<CommandSpec> {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Processes spawned, in order.
    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.lock().spawned.clone()
    }

    /// Number of spawned processes that are still running.
    pub fn running(&self) -> usize {
        self.lock().processes.iter().filter(|p| p.borrow().is_none()).count()
    }

    /// Paths of the monitor sockets bound so far.
    pub fn monitor_sockets(&self) -> Vec<PathBuf> {
        self.lock().monitors.iter().map(|(path, _)| path.clone()).collect()
    }

    fn fails(recorded: &Recorded, command: &CommandSpec) -> bool {
        recorded.failing.iter().any(|p| p(command))
    }
}

fn monitor_path(command: &CommandSpec) -> Option<PathBuf> {
    let idx = command.args.iter().position(|a| a == "-monitor")?;
    let value = command.args.get(idx + 1)?.strip_prefix("unix:")?;
    let path = value.split(',').next()?;
    Some(PathBuf::from(path))
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &CommandSpec) -> Result<()> {
        let mut recorded = self.lock();
        recorded.commands.push(command.clone());
        if Self::fails(&recorded, command) {
            return Err(CommandError::NonZeroExit {
                command: command.to_string(),
                status: ExitStatus::from_raw(1 << 8),
                stderr: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn spawn(
        &self,
        command: &CommandSpec,
        options: SpawnOptions,
    ) -> Result<SpawnedProcess> {
        let mut recorded = self.lock();
        recorded.spawned.push(command.clone());
        if Self::fails(&recorded, command) {
            return Err(CommandError::FailedToSpawn {
                command: command.to_string(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    "injected failure",
                ),
            });
        }

        if recorded.serve_monitor {
            if let Some(path) = monitor_path(command) {
                let listener = UnixListener::bind(&path).map_err(|e| {
                    CommandError::FailedToSpawn {
                        command: command.to_string(),
                        source: e,
                    }
                })?;
                recorded.monitors.push((path, listener));
            }
        }

        let initial =
            recorded.exit_code.map(|code| ExitStatus::from_raw(code << 8));
        let (exit, _) = watch::channel(initial);
        let exit = Arc::new(exit);
        recorded.processes.push(exit.clone());

        let piped = |mode: OutputMode| mode == OutputMode::Piped;
        let stdout = piped(options.stdout).then(|| {
            let bytes = recorded.stdout.clone().unwrap_or_default();
            Box::new(io::Cursor::new(bytes)) as ProcessOutput
        });
        let stderr = piped(options.stderr)
            .then(|| Box::new(tokio::io::empty()) as ProcessOutput);

        Ok(SpawnedProcess {
            handle: Box::new(FakeProcess { exit }),
            stdout,
            stderr,
        })
    }
}

/// A process which exits only when told to.
#[derive(Debug)]
pub struct FakeProcess {
    exit: Arc<ExitSender>,
}

fn exit_once(exit: &ExitSender, status: ExitStatus) {
    let _ = exit.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(status);
        true
    });
}

impl FakeProcess {
    fn exit_with_signal(&self, signal: i32) {
        exit_once(&self.exit, ExitStatus::from_raw(signal));
    }
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        let mut rx = self.exit.subscribe();
        let status = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        // wait_for only returns once the value is Some
        Ok(status.unwrap_or_else(|| ExitStatus::from_raw(0)))
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.exit_with_signal(9);
        Ok(())
    }

    fn terminate(&self) -> io::Result<()> {
        self.exit_with_signal(15);
        Ok(())
    }
}
