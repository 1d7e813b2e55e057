/// Lifecycle supervisor: spawns named tasks, turns SIGINT/SIGTERM into a
/// broadcast shutdown signal, and awaits orderly completion, reporting the
/// first task failure.
use std::future::Future;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct Supervisor {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(String, JoinHandle<anyhow::Result<()>>)>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// A handle tasks can use to subscribe to — or trigger — shutdown.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn spawn<F>(&mut self, name: &str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        info!(task = name, "starting");
        self.tasks.push((name.to_owned(), tokio::spawn(task)));
    }

    /// Install the OS signal handler that triggers shutdown.
    pub fn spawn_signal_handler(&mut self) {
        let shutdown = self.shutdown.clone();
        self.spawn("signals", async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut shutdown_rx = shutdown.subscribe();

            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = shutdown_rx.recv() => return Ok(()),
            }

            let _ = shutdown.send(());
            Ok(())
        });
    }

    /// Wait for every spawned task to finish. Returns the first error; a
    /// clean shutdown is not an error.
    pub async fn join(self) -> anyhow::Result<()> {
        let mut first_error = None;

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(Ok(())) => info!(task = %name, "stopped"),
                Ok(Err(e)) => {
                    error!(task = %name, "task failed: {e}");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(task = %name, "task panicked: {e}");
                    first_error.get_or_insert(e.into());
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
