//! Cooperative scheduler: named periodic tasks with independent cadences.
//! A task's failure is logged and the task stays armed for its next tick;
//! nothing ever deregisters it.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::error;

use crate::error::Result;

/// Spawn a named periodic task. The immediate first tick is consumed, so the
/// first run happens one full period after startup.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut task: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = task().await {
                error!(task = name, "Scheduled task failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn task_keeps_running_after_failures() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);

        let handle = spawn_periodic("flaky", Duration::from_secs(60), move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    Err(AppError::Config("transient".to_string()))
                } else {
                    Ok(())
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(60 * 4 + 1)).await;
        assert!(runs.load(Ordering::SeqCst) >= 4);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn first_run_waits_one_period() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);

        let handle = spawn_periodic("slow-start", Duration::from_secs(300), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        handle.abort();
    }
}
