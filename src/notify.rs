//! Workflow notifications
//!
//! The runner reports every transition through this port so external
//! surfaces (push channels, websockets, UIs) can mirror workflow progress.
//! Delivery is best-effort by contract: the runner logs a failed
//! notification and keeps going, so an implementation can be as unreliable
//! as the transport behind it.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use crate::Result;

/// Observer of workflow transitions
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name for logs
    fn name(&self) -> &str;

    /// A phase began running
    async fn phase_started(&self, workflow_id: &str, phase: &str, message: &str) -> Result<()>;

    /// A phase finished its work and parked for approval
    async fn phase_pending_approval(
        &self,
        workflow_id: &str,
        phase: &str,
        message: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<()>;

    /// A phase was approved and completed
    async fn phase_completed(&self, workflow_id: &str, phase: &str, message: &str) -> Result<()>;

    /// A phase failed (including retry parks)
    async fn phase_failed(&self, workflow_id: &str, phase: &str, message: &str) -> Result<()>;

    /// The set of active workflows changed
    async fn workflow_list_changed(&self) -> Result<()>;
}

/// Emits transitions through `tracing`; the default for local runs and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl LogNotifier {
    /// Create a log notifier
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn phase_started(&self, workflow_id: &str, phase: &str, message: &str) -> Result<()> {
        info!(workflow = %workflow_id, phase, "{}", message);
        Ok(())
    }

    async fn phase_pending_approval(
        &self,
        workflow_id: &str,
        phase: &str,
        message: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        if let Some(result) = result {
            info!(workflow = %workflow_id, phase, %result, "{}", message);
        } else {
            info!(workflow = %workflow_id, phase, "{}", message);
        }
        Ok(())
    }

    async fn phase_completed(&self, workflow_id: &str, phase: &str, message: &str) -> Result<()> {
        info!(workflow = %workflow_id, phase, "{}", message);
        Ok(())
    }

    async fn phase_failed(&self, workflow_id: &str, phase: &str, message: &str) -> Result<()> {
        warn!(workflow = %workflow_id, phase, "{}", message);
        Ok(())
    }

    async fn workflow_list_changed(&self) -> Result<()> {
        info!("Active workflow list changed");
        Ok(())
    }
}

/// Broadcasts to several notifiers concurrently. A failing channel is
/// logged and skipped; the broadcast itself always succeeds.
pub struct MultiNotifier {
    channels: Vec<Arc<dyn Notifier>>,
}

impl MultiNotifier {
    /// Create a broadcast over the given channels
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self { channels }
    }

    fn log_failures(&self, event: &str, results: &[Result<()>]) {
        for (channel, result) in self.channels.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    channel = channel.name(),
                    event, "Notification failed: {}", e
                );
            }
        }
    }
}

#[async_trait]
impl Notifier for MultiNotifier {
    fn name(&self) -> &str {
        "multi"
    }

    async fn phase_started(&self, workflow_id: &str, phase: &str, message: &str) -> Result<()> {
        let results = join_all(
            self.channels
                .iter()
                .map(|c| c.phase_started(workflow_id, phase, message)),
        )
        .await;
        self.log_failures("phase_started", &results);
        Ok(())
    }

    async fn phase_pending_approval(
        &self,
        workflow_id: &str,
        phase: &str,
        message: &str,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        let results = join_all(
            self.channels
                .iter()
                .map(|c| c.phase_pending_approval(workflow_id, phase, message, result)),
        )
        .await;
        self.log_failures("phase_pending_approval", &results);
        Ok(())
    }

    async fn phase_completed(&self, workflow_id: &str, phase: &str, message: &str) -> Result<()> {
        let results = join_all(
            self.channels
                .iter()
                .map(|c| c.phase_completed(workflow_id, phase, message)),
        )
        .await;
        self.log_failures("phase_completed", &results);
        Ok(())
    }

    async fn phase_failed(&self, workflow_id: &str, phase: &str, message: &str) -> Result<()> {
        let results = join_all(
            self.channels
                .iter()
                .map(|c| c.phase_failed(workflow_id, phase, message)),
        )
        .await;
        self.log_failures("phase_failed", &results);
        Ok(())
    }

    async fn workflow_list_changed(&self) -> Result<()> {
        let results = join_all(self.channels.iter().map(|c| c.workflow_list_changed())).await;
        self.log_failures("workflow_list_changed", &results);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn phase_started(&self, _: &str, _: &str, _: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Notification("transport down".to_string()))
        }

        async fn phase_pending_approval(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Option<&serde_json::Value>,
        ) -> Result<()> {
            Ok(())
        }

        async fn phase_completed(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn phase_failed(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn workflow_list_changed(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_log_notifier_is_infallible() {
        let n = LogNotifier::new();
        assert!(n.phase_started("wf-1", "plan", "started").await.is_ok());
        assert!(n
            .phase_pending_approval("wf-1", "plan", "waiting", None)
            .await
            .is_ok());
        assert!(n.phase_completed("wf-1", "plan", "done").await.is_ok());
        assert!(n.phase_failed("wf-1", "plan", "broke").await.is_ok());
        assert!(n.workflow_list_changed().await.is_ok());
    }

    #[tokio::test]
    async fn test_multi_swallows_channel_failures() {
        let flaky = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        });
        let multi = MultiNotifier::new(vec![flaky.clone(), Arc::new(LogNotifier::new())]);

        let result = multi.phase_started("wf-1", "plan", "started").await;

        assert!(result.is_ok());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }
}
