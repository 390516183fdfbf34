use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A named loop that runs its body once per period until cancelled.
///
/// The first tick fires immediately. A tick that overruns its period delays
/// the next one instead of bursting. Cancellation is observed between ticks,
/// so a tick already running completes; bodies that must discard their work
/// after a stop can check the token they are handed.
pub struct PeriodicTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        period: Duration,
        parent: &CancellationToken,
        mut body: F,
    ) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = parent.child_token();
        let loop_token = token.clone();
        let loop_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                body(loop_token.clone()).await;
                if loop_token.is_cancelled() {
                    break;
                }
            }

            tracing::debug!("{} loop stopped", loop_name);
        });

        tracing::debug!("{} loop started (every {:?})", name, period);

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request a stop. Returns immediately.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
            && self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Stop and wait for the in-flight tick to finish
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("{} loop ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let parent = CancellationToken::new();
        let c = count.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(10), &parent, move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(task.is_running());

        task.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancel_stops_child() {
        let parent = CancellationToken::new();
        let task = PeriodicTask::spawn("child", Duration::from_secs(1), &parent, |_| async {});
        parent.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_running());
    }
}
