//! Starts the consumer loops of the process and stops them together.
use std::future::Future;

use async_trait::async_trait;
use futures::future::join_all;
use refund_common::resilience::ConsumerRole;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::consumer::{ConsumerLoop, LoopExit};
use crate::error::ServiceError;

/// Builds a ready-to-run consumer loop for a role.
#[async_trait]
pub trait LoopFactory: Send + Sync {
    async fn build(&self, role: ConsumerRole) -> Result<ConsumerLoop, ServiceError>;
}

struct RunningLoop {
    name: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<LoopExit>,
}

/// Owns the running loops: one primary and one retry loop, or a single error queue loop.
pub struct Supervisor {
    loops: Vec<RunningLoop>,
}

impl Supervisor {
    /// Build every loop for the process mode and spawn each one as its own task. When a loop
    /// fails to build, the loops already built are shut down before the error is returned.
    pub async fn start(
        factory: &dyn LoopFactory,
        error_queue_mode: bool,
    ) -> Result<Self, ServiceError> {
        let roles: &[ConsumerRole] = if error_queue_mode {
            &[ConsumerRole::ErrorQueue]
        } else {
            &[ConsumerRole::Primary, ConsumerRole::Retry]
        };

        let mut built = Vec::with_capacity(roles.len());
        for role in roles {
            match factory.build(*role).await {
                Ok(consumer_loop) => built.push(consumer_loop),
                Err(build_error) => {
                    error!(role = role.as_str(), error = %build_error, "failed to build consumer loop");
                    for mut consumer_loop in built {
                        consumer_loop.shutdown().await;
                    }
                    return Err(build_error);
                }
            }
        }

        let loops = built.into_iter().map(spawn_loop).collect();
        Ok(Self { loops })
    }

    pub fn loop_names(&self) -> Vec<&str> {
        self.loops.iter().map(|l| l.name.as_str()).collect()
    }

    /// Wait for `signal`, notify every loop once and wait until all of them have closed.
    pub async fn wait_for_shutdown(
        self,
        signal: impl Future<Output = ()>,
    ) -> Result<(), ServiceError> {
        signal.await;
        info!(loops = self.loops.len(), "notifying consumer loops of shutdown");

        let mut names = Vec::with_capacity(self.loops.len());
        let mut tasks = Vec::with_capacity(self.loops.len());
        for running in self.loops {
            // A loop that already ended has dropped its receiver.
            _ = running.shutdown.send(());
            names.push(running.name);
            tasks.push(running.task);
        }

        let mut result = Ok(());
        for (name, joined) in names.into_iter().zip(join_all(tasks).await) {
            match joined {
                Ok(exit) => info!(name = %name, exit = ?exit, "consumer loop shut down"),
                Err(join_error) => {
                    error!(name = %name, error = %join_error, "consumer loop task failed");
                    if result.is_ok() {
                        result = Err(ServiceError::LoopTask {
                            loop_name: name,
                            reason: join_error.to_string(),
                        });
                    }
                }
            }
        }
        result
    }
}

fn spawn_loop(mut consumer_loop: ConsumerLoop) -> RunningLoop {
    let (shutdown, receiver) = oneshot::channel();
    let name = consumer_loop.name().to_owned();
    let task = tokio::spawn(async move { consumer_loop.run(receiver).await });

    RunningLoop {
        name,
        shutdown,
        task,
    }
}
