//! Periodic sync driver

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::SyncingRepository;

/// Runs `sync_now` every `period` on the current tokio runtime
pub struct SyncIntervalManager {
    repo: Arc<SyncingRepository>,
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncIntervalManager {
    pub fn new(repo: Arc<SyncingRepository>, period: Duration) -> Self {
        Self {
            repo,
            period,
            task: Mutex::new(None),
        }
    }

    /// Use the interval from the repository's configuration
    pub fn from_config(repo: Arc<SyncingRepository>) -> Self {
        let period = Duration::from_secs(repo.config().interval_secs.max(1));
        Self::new(repo, period)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start the periodic task. Does nothing if it is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let repo = self.repo.clone();
        let period = self.period;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let repo = repo.clone();
                match tokio::task::spawn_blocking(move || repo.sync_now()).await {
                    Ok(Ok(report)) if !report.skipped => {
                        tracing::debug!(pulled = report.pulled, pushed = report.pushed, "periodic sync done");
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::error!("periodic sync failed: {}", e),
                    Err(e) => tracing::error!("periodic sync task panicked: {}", e),
                }
            }
        }));
        tracing::info!(period_secs = period.as_secs(), "sync interval started");
    }

    /// Stop the periodic task. A pass already running finishes in the background.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!("sync interval stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SyncIntervalManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::repository::SharedRepository;
    use crate::syncing::SyncingConfig;

    fn repo() -> Arc<SyncingRepository> {
        let local: SharedRepository = Arc::new(MemoryRepository::new());
        let remote: SharedRepository = Arc::new(MemoryRepository::new());
        Arc::new(SyncingRepository::new(local, remote, SyncingConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_runs_passes_until_stopped() {
        let repo = repo();
        let manager = SyncIntervalManager::new(repo.clone(), Duration::from_millis(20));
        manager.start();
        manager.start();
        assert!(manager.is_running());

        for _ in 0..100 {
            if repo.prior_last_sync_time() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(repo.prior_last_sync_time() > 0);

        manager.stop();
        tokio::task::yield_now().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_period_from_config() {
        let manager = SyncIntervalManager::from_config(repo());
        assert_eq!(manager.period(), Duration::from_secs(300));
        assert!(!manager.is_running());
    }
}
