//! hive-cell - cell runtime for the Hive reverse-proxy fabric
//!
//! A cell is a lightweight backend process serving a slice of a site from
//! behind a front-end router (the queen). The cell keeps one authenticated
//! control session open to the queen and, whenever the queen asks, dials an
//! additional data channel that individual HTTP exchanges are streamed
//! over. If the connection drops, the session redials with backoff until it
//! is stopped.
//!
//! Applications implement [`Handler`] and hand it to a [`Cell`]; static
//! files can be registered on the cell's [`Store`](store::Store) so they
//! are served without touching the handler at all.

pub mod cell;
pub mod channel;
pub mod config;
pub mod frame;
pub mod http;
pub mod logging;
pub mod retry;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use cell::{Cell, CellConfig};
pub use channel::{Channel, FrameCallback, HeaderMap};
pub use frame::{Frame, FrameKind, Mount, RequestHead};
pub use http::{ExchangeDispatcher, Handler, Request, Response};
pub use logging::{LogLevel, Logger, NullLogger, TracingLogger};
pub use session::{Session, SessionConfig};
pub use store::Store;
pub use types::{CellError, Result};
