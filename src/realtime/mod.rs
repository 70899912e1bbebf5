use futures_util::{SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::store::ChangeNotification;

pub mod heartbeat;
pub mod protocol;

pub use heartbeat::heartbeat_loop;

use protocol::{
    EVENT_CLOSE, EVENT_ERROR, EVENT_POSTGRES_CHANGES, EVENT_REPLY, PhoenixMessage, channel_topic,
    join_message, join_reply_status, parse_change,
};

const MAX_RECONNECT_DELAY_SECONDS: u64 = 60 * 5;
const DEFAULT_RECONNECT_DELAY_SECONDS: u64 = 5;
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Join rejected: {0}")]
    JoinRejected(String),
    #[error("Connection closed: {0}")]
    Closed(String),
}

/// Per-connection frame reference counter.
fn ref_provider(counter: Arc<AtomicU64>) -> impl Fn() -> u64 + Send + Sync + Clone + 'static {
    move || counter.fetch_add(1, Ordering::SeqCst)
}

/// Reads frames until the server answers our join.
async fn await_join_ack<S>(read: &mut S, join_ref: u64) -> Result<(), RealtimeError>
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let expected_ref = join_ref.to_string();
    while let Some(frame) = read.next().await {
        if let WsMessage::Text(text) = frame? {
            let message = PhoenixMessage::parse(text.as_str())?;
            if message.event == EVENT_REPLY && message.reference.as_deref() == Some(expected_ref.as_str()) {
                return join_reply_status(&message);
            }
        }
    }
    Err(RealtimeError::Closed("socket closed during join".to_string()))
}

/// Connects, joins the user's change channel and forwards notifications until
/// the socket drops. Returns `Ok(())` when the receiving side hung up.
async fn run_connection(
    config: &TrackerConfig,
    user_id: &str,
    tx: &mpsc::Sender<ChangeNotification>,
    joined: &mut bool,
) -> Result<(), RealtimeError> {
    let url = config.realtime_url();
    info!(user_id = %user_id, "Connecting to realtime channel.");
    let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut ws_sink, mut ws_read) = ws_stream.split();

    let counter = Arc::new(AtomicU64::new(1));
    let next_ref = ref_provider(counter);
    let topic = channel_topic(user_id);
    let join_ref = next_ref();
    let join = join_message(
        &topic,
        &config.subscriptions_table,
        user_id,
        config.bearer_token(),
        join_ref,
    );
    ws_sink.send(WsMessage::text(join.to_text()?)).await?;

    tokio::time::timeout(JOIN_TIMEOUT, await_join_ack(&mut ws_read, join_ref))
        .await
        .map_err(|_| RealtimeError::Protocol("timed out waiting for join reply".to_string()))??;
    *joined = true;
    info!(user_id = %user_id, topic = %topic, "Joined realtime channel.");

    // Single writer task; the heartbeat and any future senders go through it.
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(32);
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if ws_sink.send(WsMessage::text(frame)).await.is_err() {
                error!("Failed to send frame to realtime server.");
                break;
            }
        }
    });
    let heartbeat = tokio::spawn(heartbeat_loop(
        frame_tx,
        config.realtime_heartbeat(),
        next_ref.clone(),
    ));

    let result = loop {
        let frame = match ws_read.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break Err(RealtimeError::from(e)),
            None => break Err(RealtimeError::Closed("stream ended".to_string())),
        };
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(reason) => {
                break Err(RealtimeError::Closed(format!("{reason:?}")));
            }
            _ => continue,
        };
        let message = match PhoenixMessage::parse(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable realtime frame.");
                continue;
            }
        };
        match message.event.as_str() {
            EVENT_POSTGRES_CHANGES => match parse_change(&message, user_id) {
                Ok(change) => {
                    debug!(user_id = %change.user_id, event = ?change.event, "Received subscription change.");
                    if tx.send(change).await.is_err() {
                        break Ok(());
                    }
                }
                Err(e) => warn!(error = %e, "Skipping malformed change notification."),
            },
            EVENT_CLOSE | EVENT_ERROR if message.topic == topic => {
                break Err(RealtimeError::Closed(format!(
                    "server sent {} for {}",
                    message.event, message.topic
                )));
            }
            _ => debug!(event = %message.event, topic = %message.topic, "Ignoring realtime frame."),
        }
    };

    heartbeat.abort();
    writer.abort();
    result
}

/// Keeps a change feed for `user_id` alive, reconnecting with exponential
/// backoff. Ends once `tx` has no receiver.
pub async fn realtime_listen_loop(
    config: TrackerConfig,
    user_id: String,
    tx: mpsc::Sender<ChangeNotification>,
) {
    let mut reconnect_delay_seconds = DEFAULT_RECONNECT_DELAY_SECONDS;
    loop {
        let mut joined = false;
        match run_connection(&config, &user_id, &tx, &mut joined).await {
            Ok(()) => {
                info!(user_id = %user_id, "Change receiver dropped; realtime listener exiting.");
                return;
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Realtime connection ended.");
            }
        }
        if tx.is_closed() {
            return;
        }
        if joined {
            reconnect_delay_seconds = DEFAULT_RECONNECT_DELAY_SECONDS;
        }
        info!(delay_seconds = reconnect_delay_seconds, "Sleeping before next realtime connection attempt.");
        tokio::time::sleep(Duration::from_secs(reconnect_delay_seconds)).await;
        reconnect_delay_seconds = (reconnect_delay_seconds * 2).min(MAX_RECONNECT_DELAY_SECONDS);
    }
}

/// Spawns [`realtime_listen_loop`] and returns the receiving end for the tracker.
pub fn spawn_change_feed(
    config: TrackerConfig,
    user_id: impl Into<String>,
) -> (mpsc::Receiver<ChangeNotification>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(realtime_listen_loop(config, user_id.into(), tx));
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn reply(reference: &str, status: &str) -> Result<WsMessage, WsError> {
        Ok(WsMessage::text(format!(
            r#"{{"topic":"realtime:vip_updates:u-1","event":"phx_reply","payload":{{"status":"{status}","response":{{"reason":"denied"}}}},"ref":"{reference}"}}"#
        )))
    }

    #[tokio::test]
    async fn test_join_ack_accepts_matching_ok_reply() {
        let mut frames = stream::iter(vec![reply("1", "ok")]);
        assert!(await_join_ack(&mut frames, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_join_ack_reports_rejected_join() {
        let mut frames = stream::iter(vec![reply("1", "error")]);
        let err = await_join_ack(&mut frames, 1).await.unwrap_err();
        assert!(matches!(err, RealtimeError::JoinRejected(ref msg) if msg.contains("denied")));
    }

    #[tokio::test]
    async fn test_join_ack_skips_unrelated_frames() {
        let mut frames = stream::iter(vec![
            Ok(WsMessage::Ping(Default::default())),
            reply("7", "error"),
            Ok(WsMessage::text(
                r#"{"topic":"phoenix","event":"heartbeat","payload":{},"ref":"2"}"#,
            )),
            reply("3", "ok"),
        ]);
        assert!(await_join_ack(&mut frames, 3).await.is_ok());
    }

    #[tokio::test]
    async fn test_join_ack_fails_when_stream_ends_first() {
        let mut frames = stream::iter(vec![reply("9", "ok")]);
        let err = await_join_ack(&mut frames, 1).await.unwrap_err();
        assert!(matches!(err, RealtimeError::Closed(_)));
    }

    #[tokio::test]
    async fn test_join_ack_surfaces_socket_errors() {
        let mut frames = stream::iter(vec![Err(WsError::ConnectionClosed)]);
        let err = await_join_ack(&mut frames, 1).await.unwrap_err();
        assert!(matches!(err, RealtimeError::WebSocket(_)));
    }

    #[tokio::test]
    async fn test_join_ack_rejects_garbage_frame() {
        let mut frames = stream::iter(vec![Ok(WsMessage::text("not json"))]);
        let err = await_join_ack(&mut frames, 1).await.unwrap_err();
        assert!(matches!(err, RealtimeError::Protocol(_)));
    }

    #[test]
    fn test_ref_provider_is_monotonic_and_shared() {
        let counter = Arc::new(AtomicU64::new(1));
        let a = ref_provider(counter.clone());
        let b = a.clone();
        assert_eq!(a(), 1);
        assert_eq!(b(), 2);
        assert_eq!(a(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
