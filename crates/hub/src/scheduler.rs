//! Cancellable periodic tasks.
//!
//! A [`ScheduledTask`] runs an async callback every `period` on the tokio
//! runtime until stopped. The first run happens one full period after start.
//! `stop` is idempotent, and dropping the handle stops the task.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub(crate) struct ScheduledTask {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// A handle that is not running anything.
    pub(crate) fn idle(name: &'static str) -> Self {
        Self { name, handle: None }
    }

    /// Spawn `tick` every `period`.
    pub(crate) fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick().await;
            }
        });
        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "timer started");

        Self {
            name,
            handle: Some(handle),
        }
    }

    /// Replace whatever this handle runs with a new periodic task. The old
    /// task is cancelled first so two never run at once.
    pub(crate) fn restart<F, Fut>(&mut self, period: Duration, tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        *self = Self::every(self.name, period, tick);
    }

    /// Cancel the task. Calling this on a stopped task does nothing.
    pub(crate) fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!(task = self.name, "timer stopped");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.stop();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_after_one_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let _task = ScheduledTask::every("t", Duration::from_secs(2), counting(&count));

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_ticks_and_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut task = ScheduledTask::every("t", Duration::from_secs(1), counting(&count));
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        task.stop();
        task.stop();
        assert!(!task.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_previous_task() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut task = ScheduledTask::idle("t");
        assert!(!task.is_running());

        task.restart(Duration::from_secs(1), counting(&first));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        task.restart(Duration::from_secs(1), counting(&second));
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_stops_task() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let _task = ScheduledTask::every("t", Duration::from_secs(1), counting(&count));
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
