//! HTTP exchange adapter.
//!
//! The queen streams each HTTP exchange over a data channel as a head
//! frame, optional body frames, and an end marker. [`Request`] and
//! [`Response`] wrap one such exchange for the application handler:
//! responses are push-model (write head, then chunks), request bodies are
//! pull-model (asked for lazily, then read chunk by chunk).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::channel::{Channel, ChannelReader, FrameCallback, HeaderMap};
use crate::frame::{Frame, RequestHead};
use crate::logging::Logger;
use crate::store::Store;
use crate::types::{CellError, Result};

/// Body chunk size requested from the queen when the handler never set one.
pub const DEFAULT_MAX_BODY_SIZE: usize = 8192;

/// Handles one HTTP exchange. The store gets first claim on every request;
/// whatever it does not serve lands here.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &mut Request<'_>, response: &mut Response<'_>);
}

/// The writable side of one exchange.
pub struct Response<'a> {
    channel: &'a Channel,
}

impl<'a> Response<'a> {
    pub(crate) fn new(channel: &'a Channel) -> Self {
        Self { channel }
    }

    /// Send the status code and headers.
    ///
    /// `None` is normalized to an empty header map; the head frame is never
    /// omitted. Call this at most once per exchange, before any body write -
    /// a second head corrupts the stream, and nothing here checks for it.
    pub async fn write_head(&mut self, status: u16, headers: Option<HeaderMap>) -> Result<()> {
        self.channel
            .write_response_head(status, headers.unwrap_or_default())
            .await
    }

    /// Send one chunk of the response body. Chunks are forwarded
    /// byte-for-byte, in call order.
    pub async fn write_body(&mut self, chunk: &[u8]) -> Result<()> {
        self.channel.write_response_body(chunk).await
    }
}

/// The readable side of one exchange.
pub struct Request<'a> {
    head: RequestHead,
    channel: &'a Channel,
    reader: &'a mut ChannelReader,
    asked_for_body: bool,
    max_body_size: usize,
}

impl<'a> Request<'a> {
    pub(crate) fn new(channel: &'a Channel, reader: &'a mut ChannelReader, head: RequestHead) -> Self {
        Self {
            head,
            channel,
            reader,
            asked_for_body: false,
            max_body_size: 0,
        }
    }

    /// Method, host, path, and remote address of this exchange.
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Cap the chunk size the queen is asked for. Only effective before the
    /// first body read; after that the request frame has already gone out.
    /// Unset (or zero) falls back to 8192 the first time it matters.
    pub fn set_max_body_size(&mut self, max_size: usize) {
        self.max_body_size = max_size;
    }

    async fn ensure_body_requested(&mut self) -> Result<()> {
        if self.asked_for_body {
            return Ok(());
        }
        if self.max_body_size == 0 {
            self.max_body_size = DEFAULT_MAX_BODY_SIZE;
        }
        self.channel.request_body(self.max_body_size).await?;
        self.asked_for_body = true;
        Ok(())
    }

    /// Read one chunk of the request body.
    ///
    /// Returns `(true, data)` for a body chunk and `(false, data)` once the
    /// body has ended; the terminal frame may still carry trailing data.
    /// Any other frame kind is a protocol error that breaks this exchange.
    pub async fn read_body_chunk(&mut self) -> Result<(bool, Bytes)> {
        self.ensure_body_requested().await?;
        match self.reader.read_frame().await {
            Ok(Frame::RequestBody(data)) => Ok((true, data)),
            Ok(Frame::RequestBodyEnd(data)) => Ok((false, data)),
            Ok(other) => Err(CellError::UnexpectedFrame {
                context: "request body",
                kind: other.kind(),
            }),
            Err(err) => {
                self.channel.sever();
                Err(err)
            }
        }
    }

    /// Read the whole request body, appending to `buf` in arrival order.
    ///
    /// Returns the number of bytes appended. On error, whatever was read
    /// before the failure is still in `buf`.
    pub async fn read_body_full(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let start = buf.len();
        loop {
            let (more, data) = self.read_body_chunk().await?;
            buf.extend_from_slice(&data);
            if !more {
                break;
            }
        }
        Ok(buf.len() - start)
    }
}

/// Routes data channel frames into exchanges.
///
/// On a request head frame the store gets the first chance to claim the
/// request; unclaimed requests go to the application handler. Either way,
/// exactly one response end frame is sent once dispatch returns.
pub struct ExchangeDispatcher {
    handler: Arc<dyn Handler>,
    store: Option<Arc<Store>>,
    log: Arc<dyn Logger>,
}

impl ExchangeDispatcher {
    pub fn new(handler: Arc<dyn Handler>, store: Option<Arc<Store>>, log: Arc<dyn Logger>) -> Self {
        Self {
            handler,
            store,
            log,
        }
    }

    async fn dispatch(&self, channel: &Arc<Channel>, reader: &mut ChannelReader, head: RequestHead) {
        let mut response = Response::new(channel);
        if let Some(store) = &self.store {
            match store.try_handle(&mut response, &head).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    self.log.error(&format!("store error: {err}"));
                    return;
                }
            }
        }
        let mut request = Request::new(channel, reader, head);
        self.handler.handle(&mut request, &mut response).await;
    }
}

#[async_trait]
impl FrameCallback for ExchangeDispatcher {
    async fn on_frame(&self, channel: &Arc<Channel>, reader: &mut ChannelReader, frame: Frame) {
        match frame {
            Frame::RequestHead(head) => {
                self.log.info(&format!(
                    "request for \"{}{}\" by {}",
                    head.host, head.path, head.remote_addr
                ));
                self.dispatch(channel, reader, head).await;
                // the end marker belongs to the channel layer, not the
                // handler; it goes out no matter what the handler did
                if let Err(err) = channel.write_response_end().await {
                    self.log.error(&format!("cannot finish exchange: {err}"));
                }
            }
            Frame::Unknown { kind, .. } => {
                self.log
                    .debug(&format!("ignoring unknown frame kind 0x{kind:02x}"));
            }
            other => {
                self.log
                    .debug(&format!("ignoring {} frame on data channel", other.kind()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::idle_pair;
    use crate::frame::{BodyWant, FrameKind};
    use crate::logging::NullLogger;

    fn head() -> RequestHead {
        RequestHead {
            method: "POST".into(),
            host: "example.com".into(),
            path: "/submit".into(),
            remote_addr: "10.0.0.1:9999".into(),
        }
    }

    #[tokio::test]
    async fn write_head_normalizes_missing_headers() {
        let (channel, _cell_reader, mut queen_reader, _queen_writer) = idle_pair();
        Response::new(&channel).write_head(200, None).await.unwrap();

        match queen_reader.read_frame().await.unwrap() {
            Frame::ResponseHead(sent) => {
                assert_eq!(sent.status, 200);
                assert!(sent.headers.is_empty());
            }
            other => panic!("queen read {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn first_body_read_requests_the_body_once() {
        let (channel, mut cell_reader, mut queen_reader, mut queen_writer) = idle_pair();
        let head = head();

        // queen pre-loads two chunks and the end marker
        queen_writer
            .write_frame(&Frame::RequestBody(Bytes::from_static(b"abcd")))
            .await
            .unwrap();
        queen_writer
            .write_frame(&Frame::RequestBodyEnd(Bytes::new()))
            .await
            .unwrap();

        let mut request = Request::new(&channel, &mut cell_reader, head);
        request.set_max_body_size(2048);

        let (more, data) = request.read_body_chunk().await.unwrap();
        assert!(more);
        assert_eq!(&data[..], b"abcd");

        // the size set after the first read must not re-request
        request.set_max_body_size(64);
        let (more, data) = request.read_body_chunk().await.unwrap();
        assert!(!more);
        assert!(data.is_empty());

        drop(request);
        drop(cell_reader);
        drop(channel);

        // exactly one want frame went out, carrying the pre-read size
        match queen_reader.read_frame().await.unwrap() {
            Frame::RequestBodyWant(BodyWant { max_size }) => assert_eq!(max_size, 2048),
            other => panic!("queen read {:?}", other.kind()),
        }
        assert!(matches!(
            queen_reader.read_frame().await,
            Err(CellError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn unset_body_size_defaults_to_8192() {
        let (channel, mut cell_reader, mut queen_reader, mut queen_writer) = idle_pair();
        queen_writer
            .write_frame(&Frame::RequestBodyEnd(Bytes::new()))
            .await
            .unwrap();

        let mut request = Request::new(&channel, &mut cell_reader, head());
        let (more, _) = request.read_body_chunk().await.unwrap();
        assert!(!more);

        match queen_reader.read_frame().await.unwrap() {
            Frame::RequestBodyWant(BodyWant { max_size }) => {
                assert_eq!(max_size, DEFAULT_MAX_BODY_SIZE)
            }
            other => panic!("queen read {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn read_body_full_concatenates_chunks() {
        let (channel, mut cell_reader, _queen_reader, mut queen_writer) = idle_pair();
        queen_writer
            .write_frame(&Frame::RequestBody(Bytes::from_static(b"abcd")))
            .await
            .unwrap();
        queen_writer
            .write_frame(&Frame::RequestBody(Bytes::from_static(b"ef")))
            .await
            .unwrap();
        queen_writer
            .write_frame(&Frame::RequestBodyEnd(Bytes::new()))
            .await
            .unwrap();

        let mut request = Request::new(&channel, &mut cell_reader, head());
        let mut body = Vec::new();
        let read = request.read_body_full(&mut body).await.unwrap();
        assert_eq!(read, 6);
        assert_eq!(body, b"abcdef");
    }

    #[tokio::test]
    async fn wrong_kind_during_body_is_a_protocol_error() {
        let (channel, mut cell_reader, _queen_reader, mut queen_writer) = idle_pair();
        queen_writer.write_frame(&Frame::ChannelNeeded).await.unwrap();

        let mut request = Request::new(&channel, &mut cell_reader, head());
        let err = request.read_body_chunk().await.unwrap_err();
        assert!(matches!(
            err,
            CellError::UnexpectedFrame {
                kind: FrameKind::ChannelNeeded,
                ..
            }
        ));
        // a sequencing error alone does not tear the channel down
        assert!(!channel.is_garbage());
    }

    struct SilentHandler;

    #[async_trait]
    impl Handler for SilentHandler {
        async fn handle(&self, _request: &mut Request<'_>, _response: &mut Response<'_>) {}
    }

    struct HelloHandler;

    #[async_trait]
    impl Handler for HelloHandler {
        async fn handle(&self, _request: &mut Request<'_>, response: &mut Response<'_>) {
            response.write_head(200, None).await.unwrap();
            response.write_body(b"hello").await.unwrap();
        }
    }

    #[tokio::test]
    async fn dispatcher_sends_exactly_one_end_frame_for_a_silent_handler() {
        let (channel, mut cell_reader, mut queen_reader, _queen_writer) = idle_pair();
        let dispatcher =
            ExchangeDispatcher::new(Arc::new(SilentHandler), None, Arc::new(NullLogger));

        dispatcher
            .on_frame(&channel, &mut cell_reader, Frame::RequestHead(head()))
            .await;
        drop(cell_reader);
        drop(channel);

        assert_eq!(queen_reader.read_frame().await.unwrap(), Frame::ResponseEnd);
        assert!(matches!(
            queen_reader.read_frame().await,
            Err(CellError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn dispatcher_runs_the_handler_then_ends_the_exchange() {
        let (channel, mut cell_reader, mut queen_reader, _queen_writer) = idle_pair();
        let dispatcher =
            ExchangeDispatcher::new(Arc::new(HelloHandler), None, Arc::new(NullLogger));

        dispatcher
            .on_frame(&channel, &mut cell_reader, Frame::RequestHead(head()))
            .await;

        match queen_reader.read_frame().await.unwrap() {
            Frame::ResponseHead(sent) => assert_eq!(sent.status, 200),
            other => panic!("queen read {:?}", other.kind()),
        }
        match queen_reader.read_frame().await.unwrap() {
            Frame::ResponseBody(data) => assert_eq!(&data[..], b"hello"),
            other => panic!("queen read {:?}", other.kind()),
        }
        assert_eq!(queen_reader.read_frame().await.unwrap(), Frame::ResponseEnd);
    }
}
