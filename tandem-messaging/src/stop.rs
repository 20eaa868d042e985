//! Stop signalling for long-running consumption.

use tokio::sync::watch;

/// Create a linked stop handle and signal.
pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

/// Fires the stop signal. Cloneable; dropping every handle also stops.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal observing this handle.
    pub fn subscribe(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observed by the loop; completes once stop has been requested.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Whether stop has already been requested.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Wait until stop is requested or every handle is gone.
    pub async fn stopped(&mut self) {
        // An error means all senders were dropped, which counts as stop.
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}
