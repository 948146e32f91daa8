//! Cell orchestration.
//!
//! A [`Cell`] wires an application handler and a static file store to a
//! session controller and drives process lifetime: parse the command line,
//! set up logging, then keep the session alive until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::config::Args;
use crate::frame::Mount;
use crate::http::{ExchangeDispatcher, Handler};
use crate::logging::{self, Logger, TracingLogger};
use crate::session::{Session, SessionConfig};
use crate::store::Store;
use crate::types::Result;

/// Static configuration for one cell process.
#[derive(Debug, Clone)]
pub struct CellConfig {
    /// Human-readable description, shown in the startup banner.
    pub description: String,
    /// Which (host, path) traffic this cell serves.
    pub mount: Mount,
    /// Root directory the store resolves registered paths against.
    pub data_directory: PathBuf,
    /// Queen address, `host:port`.
    pub queen_address: String,
    /// Shared key for the session handshake.
    pub key: String,
    /// Root certificate to verify the queen against. `None` enables the
    /// insecure test mode.
    pub root_cert: Option<PathBuf>,
}

/// One cell process: store, handler, and the session keeping it mounted.
pub struct Cell {
    config: CellConfig,
    handler: Arc<dyn Handler>,
    store: Arc<Store>,
    log: Arc<dyn Logger>,
}

impl Cell {
    pub fn new(config: CellConfig, handler: Arc<dyn Handler>) -> Self {
        let log: Arc<dyn Logger> = Arc::new(TracingLogger);
        let store = Arc::new(Store::new(&config.data_directory, log.clone()));
        Self {
            config,
            handler,
            store,
            log,
        }
    }

    /// The cell's static file store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Register a file on a url path. See [`Store::register_file`].
    pub async fn register_file(
        &self,
        file_path: &str,
        web_path: &str,
        auto_reload: bool,
    ) -> Result<()> {
        self.store.register_file(file_path, web_path, auto_reload).await
    }

    /// Register a directory on a url path. See [`Store::register_dir`].
    pub async fn register_dir(&self, dir_path: &str, web_path: &str, active: bool) -> Result<()> {
        self.store.register_dir(dir_path, web_path, active).await
    }

    /// Unregister the file at a url path, freeing it from memory.
    pub async fn unregister_file(&self, web_path: &str) -> Result<()> {
        self.store.unregister_file(web_path).await
    }

    /// Unregister the directory at a url path, freeing it from memory.
    pub async fn unregister_dir(&self, web_path: &str) -> Result<()> {
        self.store.unregister_dir(web_path).await
    }

    /// Run the cell until Ctrl-C.
    ///
    /// Parses the command line, installs the logging subscriber, then hands
    /// control to the session's reconnect loop.
    pub async fn run(&self) {
        let args = Args::parse();
        let _log_guard = logging::init(args.log_level, args.log_directory.as_deref());

        self.log.info("======================================");
        self.log.info(&format!("  {}", self.config.description));
        self.log.info("======================================");
        self.log
            .info(&format!("queen: {}", self.config.queen_address));
        self.log.info(&format!(
            "mount: {}{}",
            self.config.mount.host, self.config.mount.path
        ));

        let dispatcher = ExchangeDispatcher::new(
            self.handler.clone(),
            Some(self.store.clone()),
            self.log.clone(),
        );
        let session = Session::new(Arc::new(dispatcher), self.log.clone());
        let session_config = SessionConfig {
            address: self.config.queen_address.clone(),
            key: self.config.key.clone(),
            root_cert: self.config.root_cert.clone(),
            mount: self.config.mount.clone(),
        };

        tokio::select! {
            _ = session.ensure(&session_config) => {}
            _ = tokio::signal::ctrl_c() => {
                self.log.info("shutting down");
                session.stop().await;
            }
        }
    }
}
