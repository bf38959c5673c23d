use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::event::{Notice, SessionEvent};
use super::store::SharedStore;
use crate::client::ChatApi;
use crate::config::ChatConfig;
use crate::error::jitter_fraction;
use crate::models::RoomKey;

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub interval: Duration,
    /// Upper bound of the random delay added to every interval
    pub jitter: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            jitter: Duration::from_millis(250),
        }
    }
}

impl PollerSettings {
    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            jitter: config.poll_jitter(),
        }
    }

    fn next_delay(&self) -> Duration {
        self.interval + self.jitter.mul_f64(jitter_fraction())
    }
}

/// What the poller refreshes and who it reports to.
pub struct PollTarget {
    pub api: Arc<dyn ChatApi>,
    pub store: SharedStore,
    pub room: RoomKey,
    pub viewer_id: String,
    pub events: broadcast::Sender<SessionEvent>,
}

/// Background history refresh used while live delivery is unavailable.
///
/// Ticks are skipped while the view is hidden. Dropping the poller stops it.
pub struct HistoryPoller {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HistoryPoller {
    pub fn start(target: PollTarget, settings: PollerSettings, visible: watch::Receiver<bool>) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        info!(
            room = %target.room,
            interval_ms = settings.interval.as_millis() as u64,
            "Starting history poller"
        );
        let task = tokio::spawn(poll_loop(target, settings, visible, shutdown_rx));
        Self {
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map_or(false, |task| !task.is_finished())
    }

    /// Stop after the current tick and wait for the task to end.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("History poller stopped");
    }
}

impl Drop for HistoryPoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn poll_loop(
    target: PollTarget,
    settings: PollerSettings,
    visible: watch::Receiver<bool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut failing = false;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = tokio::time::sleep(settings.next_delay()) => {
                if !*visible.borrow() {
                    debug!("View hidden, skipping history poll");
                    continue;
                }

                match target
                    .store
                    .refresh(target.api.as_ref(), &target.room, &target.viewer_id)
                    .await
                {
                    Ok(changed) => {
                        if failing {
                            info!("History polling recovered");
                            failing = false;
                        }
                        if changed > 0 {
                            debug!(changed, "History poll merged new messages");
                            let count = target.store.len();
                            let _ = target.events.send(SessionEvent::MessagesChanged { count });
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "History poll failed");
                        if !failing {
                            failing = true;
                            let _ = target.events.send(SessionEvent::Notice(Notice::from_error(&e)));
                        }
                    }
                }
            }
        }
    }
}
