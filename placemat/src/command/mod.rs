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

//! External command execution.
//!
//! Every OS-level side effect (links, namespaces, firewall rules, hypervisor
//! and pod runtime processes) is expressed as a [CommandSpec] and handed to a
//! [CommandRunner]. Sequences of commands are executed with one of two
//! strategies:
//!
//! * [run_or_abort] stops at the first failing command and returns its error.
//! * [run_and_collect_first_error] runs every command regardless of failures
//!   and returns the first error it saw. Used when tearing things down.

pub use self::{
    error::CommandError,
    output::forward_lines,
    runner::{
        CommandRunner, HostCommandRunner, OutputMode, ProcessHandle,
        ProcessOutput, SpawnOptions, SpawnedProcess,
    },
    spec::CommandSpec,
};
use tracing::warn;

mod error;
mod output;
mod runner;
mod spec;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub type Result<T> = std::result::Result<T, CommandError>;

/// Runs `commands` in order, aborting on the first failure.
pub async fn run_or_abort(
    runner: &dyn CommandRunner,
    commands: &[CommandSpec],
) -> Result<()> {
    for command in commands {
        runner.run(command).await?;
    }
    Ok(())
}

/// Runs all `commands` in order, continuing past failures.
/// Returns the first error encountered, if any.
pub async fn run_and_collect_first_error(
    runner: &dyn CommandRunner,
    commands: &[CommandSpec],
) -> Result<()> {
    let mut first_error = None;
    for command in commands {
        if let Err(e) = runner.run(command).await {
            warn!(%command, error = %e, "command failed, continuing");
            let _ = first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
