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

use super::{ClusterError, Result};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Runs node, pod and BMC tasks sharing one cancellation token.
///
/// The first task failing cancels the token. [Supervisor::wait] returns the
/// first error in completion order once every task has finished. After
/// cancellation, tasks still running when the grace period ends are
/// aborted. Dropping a task's future kills the processes it owns.
#[derive(Debug)]
pub struct Supervisor {
    tasks: JoinSet<(String, Result<()>)>,
    token: CancellationToken,
    grace: Duration,
}

impl Supervisor {
    pub fn new(token: CancellationToken, grace: Duration) -> Self {
        Self { tasks: JoinSet::new(), token, grace }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "spawning task");
        let _ = self.tasks.spawn(async move {
            let result = AssertUnwindSafe(task).catch_unwind().await;
            let result = result.unwrap_or_else(|_| {
                Err(ClusterError::TaskPanicked { task: name.clone() })
            });
            (name, result)
        });
    }

    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;
        let mut deadline = None;

        loop {
            if deadline.is_none() && self.token.is_cancelled() {
                deadline = Some(Instant::now() + self.grace);
            }

            let joined = match deadline {
                None => tokio::select! {
                    joined = self.tasks.join_next() => joined,
                    _ = self.token.cancelled() => continue,
                },
                Some(deadline) => {
                    let next = self.tasks.join_next();
                    match tokio::time::timeout_at(deadline, next).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            warn!(
                                remaining = self.tasks.len(),
                                grace = ?self.grace,
                                "tasks did not stop in time, aborting them"
                            );
                            self.tasks.abort_all();
                            while self.tasks.join_next().await.is_some() {}
                            break;
                        }
                    }
                }
            };
            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((name, Ok(()))) => debug!(task = %name, "task finished"),
                Ok((name, Err(e))) => {
                    error!(task = %name, error = %e, "task failed");
                    self.token.cancel();
                    let _ = first_error.get_or_insert(e);
                }
                // aborted
                Err(e) => debug!(error = %e, "task did not complete"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn failure(task: &str) -> ClusterError {
        ClusterError::TaskPanicked { task: task.into() }
    }

    #[tokio::test(start_paused = true)]
    async fn first_error_cancels_the_others() {
        let token = CancellationToken::new();
        let mut supervisor = Supervisor::new(token.clone(), Duration::from_secs(10));
        let observed = Arc::new(AtomicBool::new(false));

        supervisor.spawn("fails-first", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(failure("first"))
        });
        supervisor.spawn("fails-later", async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(failure("second"))
        });
        supervisor.spawn("waits", {
            let token = token.clone();
            let observed = observed.clone();
            async move {
                token.cancelled().await;
                observed.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        let err = supervisor.wait().await.unwrap_err();
        assert!(matches!(err, ClusterError::TaskPanicked { task } if task == "first"));
        assert!(token.is_cancelled());
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_tasks_report_success() {
        let token = CancellationToken::new();
        let mut supervisor = Supervisor::new(token.clone(), Duration::from_secs(10));
        for i in 0..3 {
            let token = token.clone();
            supervisor.spawn(format!("task-{i}"), async move {
                token.cancelled().await;
                Ok(())
            });
        }

        token.cancel();
        assert!(supervisor.wait().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_tasks_are_aborted_after_the_grace_period() {
        let token = CancellationToken::new();
        let grace = Duration::from_secs(5);
        let mut supervisor = Supervisor::new(token.clone(), grace);
        supervisor.spawn("ignores-cancellation", async {
            std::future::pending::<()>().await;
            Ok(())
        });

        let start = Instant::now();
        token.cancel();
        assert!(supervisor.wait().await.is_ok());
        assert_eq!(start.elapsed(), grace);
    }

    async fn explode() -> Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panics_are_errors() {
        let mut supervisor =
            Supervisor::new(CancellationToken::new(), Duration::from_secs(1));
        supervisor.spawn("panics", explode());

        let err = supervisor.wait().await.unwrap_err();
        assert!(matches!(err, ClusterError::TaskPanicked { task } if task == "panics"));
    }

    #[tokio::test]
    async fn no_tasks_is_success() {
        let supervisor =
            Supervisor::new(CancellationToken::new(), Duration::from_secs(1));
        assert!(supervisor.is_empty());
        assert!(supervisor.wait().await.is_ok());
    }
}
