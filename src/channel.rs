//! Data channels.
//!
//! A channel is one TLS connection the queen opens exchanges over. Each
//! channel owns a background read task that routes every inbound frame to a
//! callback, in arrival order. The session controller owns the registry
//! entry; the channel owns its connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::frame::{BodyWant, ConnectionRole, Frame, Identity, ResponseHead};
use crate::logging::Logger;
use crate::transport::{FrameReader, FrameWriter, TlsClient};
use crate::types::{CellError, Result};

/// Header multimap carried by a response head frame.
pub type HeaderMap = HashMap<String, Vec<String>>;

/// Reader half of a channel's connection, boxed so tests can substitute an
/// in-memory pipe for the TLS stream.
pub type ChannelReader = FrameReader<Box<dyn AsyncRead + Send + Unpin>>;
pub type ChannelWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Receives every frame a channel's read task pulls off the wire.
///
/// The reader is handed to the callback so body streaming can pull further
/// frames from the same connection while the read loop waits for the
/// callback to return.
#[async_trait]
pub trait FrameCallback: Send + Sync {
    async fn on_frame(&self, channel: &Arc<Channel>, reader: &mut ChannelReader, frame: Frame);
}

/// One live data connection to the queen.
pub struct Channel {
    id: Uuid,
    writer: Mutex<ChannelWriter>,
    /// True while the background read task is running.
    listening: AtomicBool,
    /// True once the read task has exited; the registry sweep removes
    /// garbage channels.
    garbage: AtomicBool,
    cancel: CancellationToken,
    done: Mutex<Option<oneshot::Receiver<()>>>,
    log: Arc<dyn Logger>,
}

impl Channel {
    /// Dial a new channel and authenticate it against the queen.
    ///
    /// Sends the identity frame carrying the owning session's uuid and key,
    /// and expects a single accept frame back. Anything else closes the
    /// connection and fails with an error naming the received kind. On
    /// success the read task is already running when this returns.
    pub async fn spawn(
        address: &str,
        session: Uuid,
        key: &str,
        callback: Arc<dyn FrameCallback>,
        tls: &TlsClient,
        log: Arc<dyn Logger>,
    ) -> Result<Arc<Channel>> {
        log.debug("connecting new channel");
        let stream = tls.connect(address).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: ChannelReader = FrameReader::new(Box::new(read_half));
        let mut writer: ChannelWriter = FrameWriter::new(Box::new(write_half));

        writer
            .write_frame(&Frame::Identity(Identity {
                role: ConnectionRole::Channel,
                session: Some(session),
                key: key.to_owned(),
            }))
            .await?;

        match reader.read_frame().await? {
            Frame::Accept(_) => {}
            other => {
                let _ = writer.shutdown().await;
                return Err(CellError::UnexpectedFrame {
                    context: "channel handshake",
                    kind: other.kind(),
                });
            }
        }
        log.debug("channel accepted");

        Ok(Self::start(reader, writer, callback, log))
    }

    /// Build the channel object and start its read task.
    pub(crate) fn start(
        reader: ChannelReader,
        writer: ChannelWriter,
        callback: Arc<dyn FrameCallback>,
        log: Arc<dyn Logger>,
    ) -> Arc<Channel> {
        let (done_tx, done_rx) = oneshot::channel();
        let channel = Arc::new(Channel {
            id: Uuid::new_v4(),
            writer: Mutex::new(writer),
            listening: AtomicBool::new(true),
            garbage: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            done: Mutex::new(Some(done_rx)),
            log,
        });
        tokio::spawn(Self::read_loop(channel.clone(), reader, callback, done_tx));
        channel
    }

    async fn read_loop(
        channel: Arc<Channel>,
        mut reader: ChannelReader,
        callback: Arc<dyn FrameCallback>,
        _done: oneshot::Sender<()>,
    ) {
        channel.log.debug("channel listening");
        loop {
            tokio::select! {
                biased;
                _ = channel.cancel.cancelled() => break,
                read = reader.read_frame() => match read {
                    Ok(frame) => callback.on_frame(&channel, &mut reader, frame).await,
                    Err(CellError::ConnectionClosed) => break,
                    Err(err) => {
                        channel.log.error(&format!("channel error: {err}"));
                        break;
                    }
                },
            }
        }
        channel.listening.store(false, Ordering::Release);
        channel.garbage.store(true, Ordering::Release);
        channel.log.debug("channel no longer listening");
        // dropping _done here releases close()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn is_garbage(&self) -> bool {
        self.garbage.load(Ordering::Acquire)
    }

    /// Close the channel.
    ///
    /// A no-op when the read task is not running, since there would be
    /// nothing to confirm the shutdown. Otherwise this cancels the read
    /// task, waits until it has fully exited, then shuts the connection
    /// down. The callback is never invoked again after `close` returns.
    ///
    /// Known limitation: concurrent `close` calls on the same channel are
    /// not supported; only one caller can consume the completion signal.
    pub async fn close(&self) {
        if !self.is_listening() {
            return;
        }
        self.log.debug("closing channel");
        self.cancel.cancel();
        let done = self.done.lock().await.take();
        if let Some(done) = done {
            let _ = done.await;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.log.debug("channel closed");
    }

    /// Mark the channel dead without waiting for the read task.
    ///
    /// Called from frame i/o when the connection fails: the channel removes
    /// itself from active use instead of leaving callers to retry on a dead
    /// connection. Unlike [`close`](Self::close) this never blocks, so it is
    /// safe to call from inside the read task's own callback.
    pub(crate) fn sever(&self) {
        self.garbage.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Write one frame, severing the channel on failure.
    pub async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.write_frame(frame).await {
            Ok(()) => Ok(()),
            Err(err) => {
                drop(writer);
                self.sever();
                Err(err)
            }
        }
    }

    /// Send the response head. Must be called at most once per exchange,
    /// before any body chunk; the wire has no way to repair a second head.
    pub async fn write_response_head(&self, status: u16, headers: HeaderMap) -> Result<()> {
        self.write_frame(&Frame::ResponseHead(ResponseHead { status, headers }))
            .await
    }

    /// Send one raw chunk of the response body.
    pub async fn write_response_body(&self, chunk: &[u8]) -> Result<()> {
        self.write_frame(&Frame::ResponseBody(Bytes::copy_from_slice(chunk)))
            .await
    }

    /// Terminate the exchange. The dispatcher sends this exactly once after
    /// the handler returns.
    pub(crate) async fn write_response_end(&self) -> Result<()> {
        self.write_frame(&Frame::ResponseEnd).await
    }

    /// Ask the queen to start streaming the request body, in chunks of at
    /// most `max_size` bytes.
    pub(crate) async fn request_body(&self, max_size: usize) -> Result<()> {
        self.write_frame(&Frame::RequestBodyWant(BodyWant { max_size }))
            .await
    }
}
