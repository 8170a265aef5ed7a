//! Transfer channel over one connected terminal socket

use crate::transport::TransportStream;
use paylink_shared::codec::{self, FrameAssembler};
use paylink_shared::link::EVENT_CAPACITY;
use paylink_shared::Message;
use std::io;
use std::sync::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Configuration for a transfer channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bytes requested per socket read
    pub read_buffer_size: usize,
    /// Frames a slow subscriber may fall behind before it lags
    pub event_capacity: usize,
    /// Drop any unfinished frame that grows past this many bytes
    pub max_frame_len: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            event_capacity: EVENT_CAPACITY,
            max_frame_len: None,
        }
    }
}

/// Why a read loop ended on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEnd {
    /// The terminal closed the socket
    PeerClosed,
    /// The socket returned an I/O error
    ReadFailed(String),
}

/// Events published by a transfer channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A complete frame from the terminal
    Frame(Message),
    /// The read loop stopped; published once, never after `close()`
    Terminated(ChannelEnd),
}

/// Owns one connected socket.
///
/// The read side runs in a background task that assembles frames and
/// publishes them to every subscriber in arrival order. The write side is
/// shared behind a lock so concurrent writers never interleave a frame.
pub struct TransferChannel {
    peer: String,
    config: ChannelConfig,
    reader: SyncMutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    events: broadcast::Sender<TransferEvent>,
    cancel: CancellationToken,
}

impl TransferChannel {
    /// Take ownership of a connected socket
    pub fn new<S: TransportStream>(stream: S, config: ChannelConfig) -> Self {
        let peer = stream.peer();
        let (reader, writer) = tokio::io::split(stream);
        let (events, _) = broadcast::channel(config.event_capacity);

        Self {
            peer,
            config,
            reader: SyncMutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Some(Box::new(writer))),
            events,
            cancel: CancellationToken::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Subscribe to channel events. Subscribe before [`start`](Self::start)
    /// to see every frame.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Spawn the read loop. Later calls do nothing.
    pub fn start(&self) {
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(reader) = reader else {
            return;
        };

        tokio::spawn(read_loop(
            reader,
            self.events.clone(),
            self.cancel.clone(),
            self.peer.clone(),
            self.config.clone(),
        ));
    }

    /// Whether the socket is still usable
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolves once the channel is closed by either side
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Write one frame, appending the terminator if missing.
    ///
    /// Returns `false` on any I/O failure or once closed.
    pub async fn write(&self, payload: &[u8]) -> bool {
        if !self.is_open() {
            return false;
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        let frame = codec::terminate(payload);
        let result: io::Result<()> = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(peer = %self.peer, bytes = frame.len(), "frame written");
                true
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "write failed");
                false
            }
        }
    }

    /// Close the socket. Safe to call repeatedly and while a read is pending;
    /// nothing is published afterwards.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
            info!(peer = %self.peer, "channel closed");
        }
    }
}

impl Drop for TransferChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop(
    mut reader: BoxedReader,
    events: broadcast::Sender<TransferEvent>,
    cancel: CancellationToken,
    peer: String,
    config: ChannelConfig,
) {
    let mut assembler = FrameAssembler::with_max_frame_len(config.max_frame_len);
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];

    let end = loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break None,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break Some(ChannelEnd::PeerClosed),
                Ok(n) => n,
                Err(e) => break Some(ChannelEnd::ReadFailed(e.to_string())),
            },
        };

        for frame in assembler.feed(&buf[..n]) {
            if cancel.is_cancelled() {
                break;
            }
            debug!(peer = %peer, frame = %frame, "received frame");
            let _ = events.send(TransferEvent::Frame(Message::remote(frame)));
        }

        let overflowed = assembler.take_overflowed();
        if overflowed > 0 {
            warn!(peer = %peer, bytes = overflowed, "dropped oversized frame");
        }
    };

    let dropped = assembler.finish();
    if dropped > 0 {
        debug!(peer = %peer, bytes = dropped, "discarded incomplete frame");
    }

    // An error racing a caller-initiated close is not reported
    if cancel.is_cancelled() {
        return;
    }
    if let Some(end) = end {
        info!(peer = %peer, reason = ?end, "read loop ended");
        cancel.cancel();
        let _ = events.send(TransferEvent::Terminated(end));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    impl TransportStream for DuplexStream {
        fn peer(&self) -> String {
            "duplex".into()
        }
    }

    fn channel_pair() -> (TransferChannel, DuplexStream) {
        let (local, remote) = duplex(4096);
        (TransferChannel::new(local, ChannelConfig::default()), remote)
    }

    async fn next_frame(rx: &mut broadcast::Receiver<TransferEvent>) -> String {
        match rx.recv().await.unwrap() {
            TransferEvent::Frame(message) => message.into_text(),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frames_published_in_order_and_noise_dropped() {
        let (channel, mut remote) = channel_pair();
        let mut rx = channel.subscribe();
        channel.start();

        remote
            .write_all(br#"{"a":1}garbageNoise{"b":2}"#)
            .await
            .unwrap();

        assert_eq!(next_frame(&mut rx).await, r#"{"a":1}"#);
        assert_eq!(next_frame(&mut rx).await, r#"{"b":2}"#);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let (channel, mut remote) = channel_pair();
        let mut rx = channel.subscribe();
        channel.start();

        remote.write_all(br#"{"status":"#).await.unwrap();
        remote.flush().await.unwrap();
        tokio::task::yield_now().await;
        remote.write_all(br#""ok"}"#).await.unwrap();

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame, r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_frames() {
        let (channel, mut remote) = channel_pair();
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();
        channel.start();

        remote.write_all(b"[1]").await.unwrap();
        assert_eq!(next_frame(&mut first).await, "[1]");
        assert_eq!(next_frame(&mut second).await, "[1]");
    }

    #[tokio::test]
    async fn test_write_appends_terminator() {
        let (channel, mut remote) = channel_pair();
        assert!(channel.write(b"{\"cmd\":1}").await);
        assert!(channel.write(b"{\"cmd\":2}\n").await);

        let mut buf = vec![0u8; 64];
        let mut received = Vec::new();
        while received.len() < 20 {
            let n = remote.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"{\"cmd\":1}\n{\"cmd\":2}\n");
    }

    #[tokio::test]
    async fn test_peer_close_terminates_once() {
        let (channel, remote) = channel_pair();
        let mut rx = channel.subscribe();
        channel.start();

        drop(remote);
        assert_eq!(
            rx.recv().await.unwrap(),
            TransferEvent::Terminated(ChannelEnd::PeerClosed)
        );
        assert!(!channel.is_open());
        assert!(!channel.write(b"{}").await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silent() {
        let (channel, mut remote) = channel_pair();
        let mut rx = channel.subscribe();
        channel.start();

        channel.close().await;
        channel.close().await;
        assert!(!channel.is_open());
        assert!(!channel.write(b"{}").await);

        // Late data and the socket teardown publish nothing
        let _ = remote.write_all(b"{\"late\":true}").await;
        drop(remote);
        tokio::task::yield_now().await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_dropped_when_capped() {
        let (local, mut remote) = duplex(4096);
        let config = ChannelConfig {
            max_frame_len: Some(16),
            ..Default::default()
        };
        let channel = TransferChannel::new(local, config);
        let mut rx = channel.subscribe();
        channel.start();

        remote
            .write_all(br#"{"pad":"xxxxxxxxxxxxxxxxxxxxxxxx"}[1]"#)
            .await
            .unwrap();

        assert_eq!(next_frame(&mut rx).await, "[1]");
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let (channel, mut remote) = channel_pair();
        let mut rx = channel.subscribe();
        channel.start();
        channel.start();

        remote.write_all(b"{}").await.unwrap();
        assert_eq!(next_frame(&mut rx).await, "{}");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
