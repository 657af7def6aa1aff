use crate::service::controller::DeviceController;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically refreshes a device.
/// Dropping the Poller stops it.
pub struct Poller {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    /// Starts polling `controller` every `interval`.
    /// The first refresh happens immediately.
    pub fn start(controller: Arc<DeviceController>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_task(controller, interval, cancel.clone()));
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stops polling; no further ticks fire after this returns.
    /// A refresh that is already in flight is allowed to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                log::error!("poll task failed: {err:#}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_task(controller: Arc<DeviceController>, interval: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let prior = controller.current();
                // The interval itself is the retry cadence
                match controller.refresh().await {
                    Some(state) if !state.same_values(&prior) => {
                        log::debug!("{controller}: {state:?}");
                    }
                    Some(_) => {}
                    None => log::debug!("{controller}: no status this tick"),
                }
            }
        }
    }

    log::debug!("{controller}: polling stopped");
}
