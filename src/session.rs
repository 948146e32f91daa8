//! Session controller.
//!
//! The session is the single long-lived control connection between this
//! cell and its queen. It authenticates, registers the cell's mount
//! pattern, then listens for control frames; when the queen signals that a
//! new channel is needed it dials one and registers it. The reconnect loop
//! keeps the whole cycle alive for the life of the process.
//!
//! One controller manages at most one live dial at a time; dialing again
//! tears the previous connection down first. Running two sessions in one
//! process is unsupported.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{Channel, ChannelReader, ChannelWriter, FrameCallback};
use crate::frame::{ConnectionRole, Frame, Identity, Mount};
use crate::logging::Logger;
use crate::retry::{Backoff, WORKED_THRESHOLD};
use crate::transport::{FrameReader, FrameWriter, TlsClient};
use crate::types::{CellError, Result};

/// Everything the reconnect loop needs to re-establish the session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Queen address, `host:port`.
    pub address: String,
    /// Shared key presented in the identity frame.
    pub key: String,
    /// Root certificate to verify the queen against. `None` enables the
    /// insecure test mode, which warns loudly.
    pub root_cert: Option<PathBuf>,
    /// Mount pattern registered after every successful dial.
    pub mount: Mount,
}

struct ControlState {
    writer: ChannelWriter,
    cancel: CancellationToken,
}

/// Credentials and dialing state carried from the accept frame into every
/// channel spawn.
struct SessionIdentity {
    uuid: Uuid,
    key: String,
    address: String,
    tls: TlsClient,
}

/// The control connection and its registry of data channels.
pub struct Session {
    control: Mutex<Option<ControlState>>,
    reader: Mutex<Option<ChannelReader>>,
    identity: RwLock<Option<SessionIdentity>>,
    channels: RwLock<HashMap<Uuid, Arc<Channel>>>,
    retry: AtomicBool,
    callback: Arc<dyn FrameCallback>,
    log: Arc<dyn Logger>,
}

impl Session {
    /// Create a disconnected session. `callback` receives every frame that
    /// arrives on any of the session's data channels.
    pub fn new(callback: Arc<dyn FrameCallback>, log: Arc<dyn Logger>) -> Self {
        Self {
            control: Mutex::new(None),
            reader: Mutex::new(None),
            identity: RwLock::new(None),
            channels: RwLock::new(HashMap::new()),
            retry: AtomicBool::new(true),
            callback,
            log,
        }
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    /// The uuid the queen assigned on the last successful dial.
    pub async fn uuid(&self) -> Option<Uuid> {
        self.identity.read().await.as_ref().map(|id| id.uuid)
    }

    /// Dial the queen and authenticate the control connection.
    ///
    /// Closes any prior connection first. Sends the identity frame with the
    /// shared key and expects exactly one accept frame carrying the session
    /// uuid; any other kind closes the connection and fails with an error
    /// naming the received kind.
    pub async fn dial(&self, address: &str, key: &str, root_cert: Option<&std::path::Path>) -> Result<()> {
        if self.control.lock().await.is_some() {
            self.close().await;
        }

        self.log.info("connecting new session");
        let tls = TlsClient::new(root_cert, &*self.log)?;

        self.log.info("dialing");
        let stream = tls.connect(address).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader: ChannelReader = FrameReader::new(Box::new(read_half));
        let mut writer: ChannelWriter = FrameWriter::new(Box::new(write_half));

        self.log.debug("requesting cell status");
        writer
            .write_frame(&Frame::Identity(Identity {
                role: ConnectionRole::Session,
                session: None,
                key: key.to_owned(),
            }))
            .await?;

        let accept = match reader.read_frame().await? {
            Frame::Accept(accept) => accept,
            other => {
                let _ = writer.shutdown().await;
                return Err(CellError::UnexpectedFrame {
                    context: "session handshake",
                    kind: other.kind(),
                });
            }
        };
        self.log
            .info(&format!("session accepted, uuid is {}", accept.uuid));

        *self.identity.write().await = Some(SessionIdentity {
            uuid: accept.uuid,
            key: accept.key,
            address: address.to_owned(),
            tls,
        });
        *self.control.lock().await = Some(ControlState {
            writer,
            cancel: CancellationToken::new(),
        });
        *self.reader.lock().await = Some(reader);
        Ok(())
    }

    /// Register this cell's mount pattern with the queen. Failures go back
    /// to the caller; nothing here retries.
    pub async fn mount(&self, host: &str, path: &str) -> Result<()> {
        let mut control = self.control.lock().await;
        let control = control.as_mut().ok_or(CellError::NotConnected)?;
        control
            .writer
            .write_frame(&Frame::Mount(Mount {
                host: host.to_owned(),
                path: path.to_owned(),
            }))
            .await
    }

    /// Listen for control frames until the connection ends.
    ///
    /// The only frame the queen sends here is "channel needed"; a channel
    /// spawn failure is logged and swallowed, it never tears the session
    /// down. Returns `Ok` on clean end-of-stream (or a local close), the
    /// terminal error otherwise.
    pub async fn listen(&self) -> Result<()> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(CellError::NotConnected)?;
        let cancel = {
            let control = self.control.lock().await;
            control
                .as_ref()
                .map(|state| state.cancel.clone())
                .ok_or(CellError::NotConnected)?
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.log.info("session closed");
                    return Ok(());
                }
                read = reader.read_frame() => match read {
                    Ok(Frame::ChannelNeeded) => {
                        self.log.debug("queen needs a new channel");
                        if let Err(err) = self.spawn_channel().await {
                            self.log.error(&format!("cannot add channel: {err}"));
                        }
                    }
                    Ok(Frame::Unknown { kind, .. }) => {
                        self.log
                            .debug(&format!("ignoring unknown frame kind 0x{kind:02x} on session"));
                    }
                    Ok(other) => {
                        self.log
                            .debug(&format!("ignoring {} frame on session", other.kind()));
                    }
                    Err(CellError::ConnectionClosed) => {
                        self.log.info("disconnected");
                        return Ok(());
                    }
                    Err(err) => {
                        self.log.error(&format!("session error: {err}"));
                        return Err(err);
                    }
                },
            }
        }
    }

    /// Dial and register a new data channel against the queen.
    ///
    /// The channel dials the same remote address as the control connection
    /// and authenticates with the session's uuid and key instead of the
    /// original login key. Garbage channels are swept from the registry
    /// every time this runs, success or not.
    pub async fn spawn_channel(&self) -> Result<()> {
        let (address, uuid, key, tls) = {
            let identity = self.identity.read().await;
            let identity = identity.as_ref().ok_or(CellError::NotConnected)?;
            (
                identity.address.clone(),
                identity.uuid,
                identity.key.clone(),
                identity.tls.clone(),
            )
        };

        let spawned = Channel::spawn(
            &address,
            uuid,
            &key,
            self.callback.clone(),
            &tls,
            self.log.clone(),
        )
        .await;

        let result = match spawned {
            Ok(channel) => {
                let mut channels = self.channels.write().await;
                channels.insert(channel.id(), channel);
                Ok(())
            }
            Err(err) => Err(err),
        };

        // housekeeping has to run every so often; spawn time is as good a
        // moment as any
        self.sweep_channels().await;
        result
    }

    /// Drop every channel whose read task has exited.
    pub(crate) async fn sweep_channels(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, channel| !channel.is_garbage());
    }

    /// Number of channels currently in the registry, garbage included.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Close the control connection and every registered channel.
    pub async fn close(&self) {
        if let Some(control) = self.control.lock().await.take() {
            control.cancel.cancel();
            let mut writer = control.writer;
            let _ = writer.shutdown().await;
        }
        *self.reader.lock().await = None;

        let channels = self.channels.read().await;
        for channel in channels.values() {
            channel.close().await;
        }
    }

    /// Close the session and keep it closed: the reconnect loop will not
    /// dial again after this.
    pub async fn stop(&self) {
        self.retry.store(false, Ordering::Release);
        self.close().await;
    }

    /// Keep the session alive until [`stop`](Self::stop).
    ///
    /// Runs dial, mount, listen in order and converts whatever ends the
    /// attempt into a backoff decision. An attempt that stayed up past the
    /// worked threshold resets the backoff. A stop request is honored both
    /// before and after each attempt; a stop mid-attempt exits without
    /// sleeping or retrying.
    pub async fn ensure(&self, config: &SessionConfig) {
        let mut backoff = Backoff::new();
        while self.retry_enabled() {
            let started = Instant::now();
            if let Err(err) = self.ensure_once(config).await {
                self.log.error(&format!("connection error: {err}"));
            }
            if !self.retry_enabled() {
                break;
            }

            let worked = started.elapsed() > WORKED_THRESHOLD;
            let delay = backoff.next_delay(worked);
            self.log.info(&format!(
                "disconnected. retrying in {} seconds",
                delay.as_secs()
            ));
            tokio::time::sleep(delay).await;
        }
    }

    async fn ensure_once(&self, config: &SessionConfig) -> Result<()> {
        self.dial(&config.address, &config.key, config.root_cert.as_deref())
            .await?;
        self.mount(&config.mount.host, &config.mount.path).await?;
        self.log.info("mounted");
        self.listen().await
    }
}
