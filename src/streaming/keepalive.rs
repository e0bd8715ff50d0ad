//! Periodic client pings
//!
//! Servers drop connections that exchange no messages for a while. During
//! long silences (e.g. an external media source that pauses) this task keeps
//! the connection warm. Incoming pings are answered by the transport itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionHandle;

/// Length of the random ping payload
const PING_PAYLOAD_SIZE: usize = 4;

const PING_PAYLOAD_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_payload() -> Vec<u8> {
    (0..PING_PAYLOAD_SIZE)
        .map(|_| PING_PAYLOAD_CHARS[rand::random_range(0..PING_PAYLOAD_CHARS.len())])
        .collect()
}

/// Ping `handle` every `interval` until cancelled or the handle closes
pub(crate) fn spawn_keepalive(
    handle: Arc<ConnectionHandle>,
    interval: Duration,
    cancel: CancellationToken,
    log_target: Arc<str>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = tokio::time::sleep(interval) => {
                    if !handle.is_open() {
                        break;
                    }
                    if let Err(e) = handle.ping(random_payload()).await {
                        log::warn!(target: &*log_target, "Error sending ping: {}", e);
                    }
                }
            }
        }
        log::debug!(target: &*log_target, "Keepalive stopped (connection #{})", handle.id());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::error::TransportError;
    use crate::streaming::transport::{Frame, FrameSink};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Outbox(Arc<Mutex<Vec<Frame>>>);

    #[async_trait]
    impl FrameSink for Outbox {
        async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
            self.0.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self, _code: u16) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn test_random_payload_shape() {
        for _ in 0..20 {
            let payload = random_payload();
            assert_eq!(payload.len(), PING_PAYLOAD_SIZE);
            assert!(payload
                .iter()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_pings_until_cancelled() {
        let outbox = Outbox::default();
        let handle = Arc::new(ConnectionHandle::new(
            1,
            Box::new(outbox.clone()),
            Arc::from("keepalive-test"),
        ));
        let cancel = CancellationToken::new();

        let task = spawn_keepalive(
            handle,
            Duration::from_millis(10),
            cancel.clone(),
            Arc::from("keepalive-test"),
        );
        tokio::time::sleep(Duration::from_millis(55)).await;
        cancel.cancel();
        task.await.unwrap();

        let frames = outbox.0.lock().unwrap();
        assert!(frames.len() >= 2, "only {} pings", frames.len());
        assert!(frames.iter().all(|f| matches!(f, Frame::Ping(p) if p.len() == 4)));
    }

    #[tokio::test]
    async fn test_stops_when_handle_closes() {
        let outbox = Outbox::default();
        let handle = Arc::new(ConnectionHandle::new(
            2,
            Box::new(outbox.clone()),
            Arc::from("keepalive-test"),
        ));
        handle.close(1000).await;

        let task = spawn_keepalive(
            handle,
            Duration::from_millis(5),
            CancellationToken::new(),
            Arc::from("keepalive-test"),
        );
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("keepalive kept running")
            .unwrap();
        assert!(outbox.0.lock().unwrap().is_empty());
    }
}
