//! Media sender: drains the caller's audio source into the connection
//!
//! # Architecture
//!
//! ```text
//! Caller audio source ──▶ MediaSender (own task) ──▶ ConnectionHandle (binary frames)
//!        (shared, survives reconnects)                    │
//!                                                         └─▶ {"event": "EOS"} when exhausted
//! ```
//!
//! One sender runs per connection attempt. It captures the handle of its own
//! attempt, so a reconnect elsewhere never retargets its sends. The audio
//! source sits behind an async mutex owned by the session: a stopped (or
//! aborted) sender leaves the partially consumed source for the next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionHandle;
use super::error::{MediaError, StreamingError};
use super::protocol::ClientEvent;

/// Caller-supplied audio: chunks of raw bytes in the negotiated encoding
pub type MediaSource = BoxStream<'static, Result<Vec<u8>, MediaError>>;

/// Audio source shared across connection attempts of one session
pub(crate) type SharedMediaSource = Arc<Mutex<MediaSource>>;

/// Receives failures from the media path. Runs on the sender task.
pub type MediaErrorCallback = Arc<dyn Fn(StreamingError) + Send + Sync>;

/// How a sender run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SenderExit {
    /// Stop requested before the source was exhausted
    Stopped,
    /// Source exhausted and EOS event sent
    Finished,
}

pub(crate) struct MediaSender {
    pub source: SharedMediaSource,
    pub handle: Arc<ConnectionHandle>,
    pub cancel: CancellationToken,
    pub media_finished: Arc<AtomicBool>,
    pub on_error: MediaErrorCallback,
    pub log_target: Arc<str>,
}

impl MediaSender {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        if let Err(e) = self.stream_media().await {
            (self.on_error)(e);
        }
    }

    pub(crate) async fn stream_media(&self) -> Result<SenderExit, StreamingError> {
        let target: &str = &self.log_target;
        let mut chunks_sent: u64 = 0;

        loop {
            let next = {
                let mut source = self.source.lock().await;
                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => {
                        log::debug!(
                            target: target,
                            "Stopping media sender after {} chunks (connection #{})",
                            chunks_sent,
                            self.handle.id()
                        );
                        return Ok(SenderExit::Stopped);
                    }

                    item = source.next() => item,
                }
            };

            match next {
                Some(Ok(chunk)) => {
                    self.handle.send_binary(chunk).await?;
                    chunks_sent += 1;

                    // Periodic logging (every 50 chunks = ~5 seconds at 100ms chunks)
                    if chunks_sent % 50 == 0 {
                        log::debug!(target: target, "Media sender: sent {} chunks", chunks_sent);
                    }
                }
                Some(Err(e)) => return Err(StreamingError::MediaSource(e)),
                None => break,
            }
        }

        log::debug!(
            target: target,
            "Finished sending media ({} chunks), sending EOS",
            chunks_sent
        );

        self.media_finished.store(true, Ordering::SeqCst);
        self.handle.send_event(&ClientEvent::eos()).await?;

        log::debug!(target: target, "Media sender finished");
        Ok(SenderExit::Finished)
    }
}

/// Callback used when the caller does not install one: log and carry on
pub fn default_media_error_callback(log_target: Arc<str>) -> MediaErrorCallback {
    Arc::new(move |err: StreamingError| {
        log::error!(target: &*log_target, "Error on media sender: {}", err);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::error::TransportError;
    use crate::streaming::transport::{Frame, FrameSink};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Outbox(Arc<StdMutex<Vec<Frame>>>);

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

    fn sender_for(source: MediaSource, outbox: &Outbox) -> MediaSender {
        let target: Arc<str> = Arc::from("media-test");
        MediaSender {
            source: Arc::new(Mutex::new(source)),
            handle: Arc::new(ConnectionHandle::new(
                1,
                Box::new(outbox.clone()),
                target.clone(),
            )),
            cancel: CancellationToken::new(),
            media_finished: Arc::new(AtomicBool::new(false)),
            on_error: default_media_error_callback(target.clone()),
            log_target: target,
        }
    }

    #[tokio::test]
    async fn test_sends_chunks_in_order_then_eos() {
        let outbox = Outbox::default();
        let chunks: Vec<Result<Vec<u8>, MediaError>> =
            vec![Ok(vec![1, 1]), Ok(vec![2, 2]), Ok(vec![3])];
        let sender = sender_for(stream::iter(chunks).boxed(), &outbox);

        let exit = sender.stream_media().await.unwrap();
        assert_eq!(exit, SenderExit::Finished);
        assert!(sender.media_finished.load(Ordering::SeqCst));

        let frames = outbox.0.lock().unwrap();
        assert_eq!(
            *frames,
            vec![
                Frame::Binary(vec![1, 1]),
                Frame::Binary(vec![2, 2]),
                Frame::Binary(vec![3]),
                Frame::Text(r#"{"event":"EOS","payload":{}}"#.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_sender_leaves_rest_of_source() {
        let outbox = Outbox::default();
        let chunks: Vec<Result<Vec<u8>, MediaError>> = (0..10u8).map(|i| Ok(vec![i])).collect();
        let sender = sender_for(stream::iter(chunks).boxed(), &outbox);

        sender.cancel.cancel();
        let exit = sender.stream_media().await.unwrap();
        assert_eq!(exit, SenderExit::Stopped);
        assert!(outbox.0.lock().unwrap().is_empty());
        assert!(!sender.media_finished.load(Ordering::SeqCst));

        // Nothing was consumed from the shared source
        let next = sender.source.lock().await.next().await;
        assert_eq!(next.unwrap().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_waiting_for_next_chunk() {
        let outbox = Outbox::default();
        let sender = sender_for(stream::pending().boxed(), &outbox);
        let cancel = sender.cancel.clone();

        let task = tokio::spawn(async move { sender.stream_media().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sender did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(exit, SenderExit::Stopped);
    }

    #[tokio::test]
    async fn test_source_error_is_returned() {
        let outbox = Outbox::default();
        let chunks: Vec<Result<Vec<u8>, MediaError>> =
            vec![Ok(vec![7]), Err("microphone unplugged".into())];
        let sender = sender_for(stream::iter(chunks).boxed(), &outbox);

        let err = sender.stream_media().await.unwrap_err();
        assert!(matches!(err, StreamingError::MediaSource(ref e) if e.to_string() == "microphone unplugged"));
        assert_eq!(*outbox.0.lock().unwrap(), vec![Frame::Binary(vec![7])]);
        assert!(!sender.media_finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_send_on_closed_handle_is_connection_error() {
        let outbox = Outbox::default();
        let chunks: Vec<Result<Vec<u8>, MediaError>> = vec![Ok(vec![1])];
        let sender = sender_for(stream::iter(chunks).boxed(), &outbox);

        sender.handle.close(1000).await;
        let err = sender.stream_media().await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
