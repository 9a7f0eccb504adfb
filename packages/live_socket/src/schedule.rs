use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::BroadcastHub;
use crate::message::BroadcastMessage;

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A periodic broadcast. Stops on `cancel()` or when dropped.
pub struct ScheduledTask {
    topic: String,
    cancel: CancellationToken,
}

impl ScheduledTask {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Broadcast `payload()` on `topic` to every socket once per `period`.
///
/// The first broadcast happens one period after the call. Periods below one
/// millisecond are raised to one. Not tied to any socket; it feeds the hub
/// like any other producer.
pub fn spawn_interval<F, P>(
    hub: Arc<BroadcastHub>,
    period: Duration,
    topic: impl Into<String>,
    payload: F,
) -> ScheduledTask
where
    F: Fn() -> P + Send + 'static,
    P: Into<Value>,
{
    let period = period.max(MIN_PERIOD);
    let topic = topic.into();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task_topic = topic.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(topic = %task_topic, period_ms = period.as_millis() as u64, "Scheduled broadcast started");
        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    hub.broadcast(BroadcastMessage::all(task_topic.clone(), payload()));
                }
            }
        }
        debug!(topic = %task_topic, "Scheduled broadcast stopped");
    });

    ScheduledTask { topic, cancel }
}
