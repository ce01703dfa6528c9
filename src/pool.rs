// src/pool.rs
use crate::executor::JobExecutor;
use crate::worker::{WorkerBuilder, WorkerConfig};
use crate::{Queue, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// What a pool did before it stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSummary {
    pub workers: usize,
    pub processed: usize,
}

/// Runs `count` workers in this process and waits for all of them to stop.
///
/// Workers stop on the shared stop signal or on this pool's own shutdown
/// flag (set by SIGINT/SIGTERM when signal handling is on). Either way each
/// worker finishes its current job first.
pub struct WorkerPool {
    queue: Queue,
    executor: Arc<dyn JobExecutor>,
    count: usize,
    template: WorkerConfig,
    name_prefix: String,
    maintenance_interval: Duration,
    handle_signals: bool,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(queue: Queue, executor: Arc<dyn JobExecutor>, count: usize) -> Self {
        Self {
            queue,
            executor,
            count: count.max(1),
            template: WorkerConfig::default(),
            name_prefix: format!("worker-{}", std::process::id()),
            maintenance_interval: Duration::from_secs(10),
            handle_signals: false,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Settings shared by every worker; the name is replaced per worker.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.template = config;
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub async fn run(self) -> Result<PoolSummary> {
        // A leftover stop request would end the new workers immediately.
        self.queue.resume().await?;

        info!(count = self.count, "Starting worker pool");

        let signal_handle = self.handle_signals.then(|| self.spawn_signal_handler());
        let maintenance_handle = self
            .template
            .reclaim_after
            .map(|after| self.spawn_maintenance(after));

        let mut handles = Vec::with_capacity(self.count);
        for i in 1..=self.count {
            let config = WorkerConfig {
                name: format!("{}-{}", self.name_prefix, i),
                ..self.template.clone()
            };
            let mut worker = WorkerBuilder::new(self.queue.clone(), Arc::clone(&self.executor))
                .with_config(config)
                .with_shutdown_flag(Arc::clone(&self.shutdown))
                .build();
            handles.push(tokio::spawn(async move { worker.run().await }));
        }

        let mut processed = 0;
        for handle in handles {
            match handle.await {
                Ok(count) => processed += count,
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }

        for handle in [signal_handle, maintenance_handle].into_iter().flatten() {
            handle.abort();
        }

        info!(processed, "Worker pool stopped");
        Ok(PoolSummary {
            workers: self.count,
            processed,
        })
    }

    fn spawn_signal_handler(&self) -> JoinHandle<()> {
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Finishing current jobs before exit");
            shutdown.store(true, Ordering::SeqCst);
        })
    }

    /// Periodically returns orphaned `Processing` jobs to the ready queue.
    fn spawn_maintenance(&self, reclaim_after: Duration) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let period = self.maintenance_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match queue.reclaim_stale(reclaim_after).await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "Reclaimed stale jobs"),
                    Err(e) => error!(error = %e, "Failed to reclaim stale jobs"),
                }
            }
        })
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                wait_for_ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = wait_for_ctrl_c() => info!("SIGINT received"),
        }
    }

    #[cfg(not(unix))]
    {
        wait_for_ctrl_c().await;
        info!("CTRL+C received");
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for CTRL+C");
        std::future::pending::<()>().await;
    }
}
