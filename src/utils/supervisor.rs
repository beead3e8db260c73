use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================================================
// Background Task Supervisor
// ============================================================================
//
// Owns the periodic loops (outbox relay, orphan sweeper, rate gate sweeper,
// health monitor). Each loop receives a shutdown signal; a loop that panics
// or returns before shutdown is restarted after `restart_delay`.
//
// Shutdown flips the signal, then joins every loop within a grace period.
// The caller stops these loops before closing the broker connection.
//
// ============================================================================

/// Resolves once shutdown was signalled or the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

struct SupervisedTask {
    name: &'static str,
    handle: JoinHandle<u32>,
}

pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    tasks: Vec<SupervisedTask>,
    restart_delay: Duration,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Vec::new(),
            restart_delay: Duration::from_secs(1),
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Run `task` until shutdown, restarting it whenever it stops on its own.
    pub fn supervise<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: Fn(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let restart_delay = self.restart_delay;

        let handle = tokio::spawn(async move {
            let mut restarts = 0u32;
            loop {
                let result = tokio::spawn(task(shutdown.clone())).await;
                if *shutdown.borrow() {
                    break;
                }

                match result {
                    Err(e) if e.is_panic() => {
                        tracing::error!(task = name, restarts = restarts, "💥 Background task panicked, restarting")
                    }
                    _ => tracing::warn!(task = name, restarts = restarts, "Background task exited early, restarting"),
                }
                restarts += 1;

                tokio::select! {
                    _ = tokio::time::sleep(restart_delay) => {}
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
            restarts
        });

        tracing::info!(task = name, "Background task started");
        self.tasks.push(SupervisedTask { name, handle });
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|task| task.name).collect()
    }

    /// Signal shutdown and wait for every task. Returns the total restart count.
    pub async fn shutdown(self, grace: Duration) -> u32 {
        let _ = self.shutdown.send(true);

        let mut restarts = 0;
        for mut task in self.tasks {
            match tokio::time::timeout(grace, &mut task.handle).await {
                Ok(Ok(count)) => {
                    restarts += count;
                    tracing::debug!(task = task.name, "Background task stopped");
                }
                Ok(Err(e)) => tracing::error!(task = task.name, error = %e, "Background task supervisor failed"),
                Err(_) => {
                    tracing::warn!(task = task.name, "Background task ignored shutdown, aborting");
                    task.handle.abort();
                }
            }
        }
        restarts
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_panicking_task_is_restarted() {
        let starts = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new().with_restart_delay(Duration::from_millis(5));

        let counter = starts.clone();
        supervisor.supervise("flaky", move |mut shutdown| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
                shutdown_requested(&mut shutdown).await;
            }
        });

        for _ in 0..100 {
            if starts.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(supervisor.shutdown(Duration::from_secs(1)).await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_task() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new();

        for name in ["relay", "sweeper"] {
            let stopped = stopped.clone();
            supervisor.supervise(name, move |mut shutdown| {
                let stopped = stopped.clone();
                async move {
                    let mut interval = tokio::time::interval(Duration::from_millis(5));
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {}
                            _ = shutdown_requested(&mut shutdown) => break,
                        }
                    }
                    stopped.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(supervisor.task_names(), vec!["relay", "sweeper"]);

        assert_eq!(supervisor.shutdown(Duration::from_secs(1)).await, 0);
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }
}
