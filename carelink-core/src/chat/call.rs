use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

/// A running call. The elapsed-seconds counter ticks once per second until
/// the call is ended or the handle is dropped.
#[derive(Debug)]
pub struct CallHandle {
    started_at: Instant,
    elapsed: watch::Receiver<u64>,
    ticker: JoinHandle<()>,
}

impl CallHandle {
    pub fn elapsed_secs(&self) -> u64 {
        *self.elapsed.borrow()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Receiver that sees every tick.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.elapsed.clone()
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

pub fn start_call() -> CallHandle {
    let started_at = Instant::now();
    let (tx, rx) = watch::channel(0u64);
    let second = Duration::from_secs(1);

    let ticker = tokio::spawn(async move {
        let mut ticks = interval_at(started_at + second, second);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticks.tick().await;
            if tx.send(started_at.elapsed().as_secs()).is_err() {
                break;
            }
        }
    });

    info!("Call timer started");
    CallHandle {
        started_at,
        elapsed: rx,
        ticker,
    }
}

/// Stop the timer and return how long the call lasted.
pub fn end_call(handle: CallHandle) -> Duration {
    handle.ticker.abort();
    let duration = handle.elapsed();
    info!(seconds = duration.as_secs(), "Call ended");
    duration
}

/// `mm:ss`, or `h:mm:ss` once past an hour.
pub fn format_elapsed(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_second() {
        let call = start_call();
        let mut ticks = call.subscribe();
        assert_eq!(call.elapsed_secs(), 0);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(call.elapsed_secs(), 3);
        assert!(ticks.has_changed().unwrap());
        assert_eq!(*ticks.borrow_and_update(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_stops_timer() {
        let call = start_call();
        let ticks = call.subscribe();
        tokio::time::sleep(Duration::from_millis(2200)).await;

        let duration = end_call(call);
        assert_eq!(duration.as_secs(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*ticks.borrow(), 2);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "00:00");
        assert_eq!(format_elapsed(75), "01:15");
        assert_eq!(format_elapsed(3725), "1:02:05");
    }
}
