//! Framed TLS transport.
//!
//! [`FrameReader`] and [`FrameWriter`] move whole frames over any byte
//! stream: a big-endian `u32` length prefix covering one tag byte plus the
//! payload. [`TlsClient`] dials the queen, either verifying against a
//! supplied root certificate or, for testing only, skipping verification
//! entirely (and saying so, loudly, every time).

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::frame::Frame;
use crate::logging::Logger;
use crate::types::{CellError, Result};

/// Upper bound on a single frame (tag + payload). Anything larger is a
/// protocol violation, not a legitimate body chunk.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const INSECURE_WARNING: &str = "WARNING!\n\
    CONTINUING WITHOUT TLS AUTHENTICATION.\n\
    THIS SHOULD ONLY BE USED FOR TESTING. DOING THIS\n\
    IN A PRODUCTION ENVIRONMENT COULD LEAVE YOUR\n\
    SYSTEM OPEN TO ATTACK.";

/// Reads one frame at a time off a byte stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read exactly one frame.
    ///
    /// End-of-stream on a frame boundary returns
    /// [`CellError::ConnectionClosed`]; end-of-stream in the middle of a
    /// frame is an i/o error like any other.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let mut len_buf = [0u8; 4];
        if let Err(err) = self.inner.read_exact(&mut len_buf).await {
            return Err(if err.kind() == std::io::ErrorKind::UnexpectedEof {
                CellError::ConnectionClosed
            } else {
                CellError::Io(err)
            });
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(CellError::InvalidFrame("zero-length frame"));
        }
        if len > MAX_FRAME_LEN {
            return Err(CellError::FrameTooLarge(len));
        }

        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;

        let mut payload = Bytes::from(buf);
        let tag = payload.split_to(1)[0];
        Frame::decode(tag, payload)
    }
}

/// Writes one frame at a time onto a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let (tag, payload) = frame.encode()?;
        let len = payload.len() + 1;
        if len > MAX_FRAME_LEN {
            return Err(CellError::FrameTooLarge(len));
        }

        self.inner.write_all(&(len as u32).to_be_bytes()).await?;
        self.inner.write_all(&[tag]).await?;
        self.inner.write_all(&payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// TLS dialer shared by the control connection and every data channel.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
}

impl TlsClient {
    /// Build a dialer.
    ///
    /// With a root certificate path, server certificates are verified
    /// against that root alone. Without one, verification is skipped - a
    /// test-only mode that logs a standing warning on every construction.
    pub fn new(root_cert: Option<&Path>, log: &dyn Logger) -> Result<Self> {
        let config = match root_cert {
            Some(path) => {
                log.debug("reading root cert");
                let pem = std::fs::read(path)?;
                let certs = rustls_pemfile::certs(&mut pem.as_slice())?;
                if certs.is_empty() {
                    return Err(CellError::RootCert(
                        "no certificates found in root cert file".into(),
                    ));
                }
                let mut roots = RootCertStore::empty();
                for der in certs {
                    roots.add(&Certificate(der))?;
                }
                ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            None => {
                log.warn(INSECURE_WARNING);
                let mut config = ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(RootCertStore::empty())
                    .with_no_client_auth();
                config
                    .dangerous()
                    .set_certificate_verifier(Arc::new(NoVerification));
                config
            }
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Dial `address` ("host:port") and complete the TLS handshake.
    pub async fn connect(&self, address: &str) -> Result<TlsStream<TcpStream>> {
        let host = host_portion(address);
        let server_name = ServerName::try_from(host)
            .map_err(|_| CellError::ServerName(address.to_string()))?;
        let stream = TcpStream::connect(address).await?;
        Ok(self.connector.connect(server_name, stream).await?)
    }
}

/// The host part of a `host:port` address, with bracketed IPv6 handled.
fn host_portion(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    match address.rsplit_once(':') {
        Some((host, _)) => host,
        None => address,
    }
}

/// Accepts any server certificate. Test mode only.
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
