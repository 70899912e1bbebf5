use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::protocol::heartbeat_message;

/// Keeps the socket alive. Exits when the writer side of the connection is gone.
pub async fn heartbeat_loop(
    tx_to_server: mpsc::Sender<String>,
    interval: Duration,
    ref_provider: impl Fn() -> u64 + Send + Sync + 'static,
) {
    let interval = if interval.is_zero() {
        Duration::from_secs(25)
    } else {
        interval
    };
    loop {
        tokio::time::sleep(interval).await;
        let frame = match heartbeat_message(ref_provider()).to_text() {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Failed to encode heartbeat frame.");
                continue;
            }
        };
        debug!(interval_secs = interval.as_secs(), "Sending realtime heartbeat.");
        if let Err(e) = tx_to_server.send(frame).await {
            error!(error = %e, "Failed to send heartbeat. Exiting heartbeat task.");
            break;
        }
    }
}
