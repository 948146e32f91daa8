//! Static file store.
//!
//! A simple resource manager for serving static files. Files and
//! directories are registered on URL paths and loaded lazily; the store is
//! given the chance to claim each request before the application handler
//! runs, and serves matches through the same response-writing API the
//! handler uses.

mod lazy_dir;
mod lazy_file;

pub use lazy_dir::LazyDir;
pub use lazy_file::LazyFile;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::frame::RequestHead;
use crate::http::Response;
use crate::logging::Logger;
use crate::types::{CellError, Result};

/// Default max-age advertised in cache-control headers.
const DEFAULT_CACHE_MAX_AGE: Duration = Duration::from_secs(4 * 60 * 60);

pub struct Store {
    files: RwLock<HashMap<String, Arc<Mutex<LazyFile>>>>,
    dirs: RwLock<HashMap<String, Arc<Mutex<LazyDir>>>>,
    root: PathBuf,
    max_age: RwLock<Duration>,
    log: Arc<dyn Logger>,
}

impl Store {
    /// Create a store rooted at `root`. Registered file and directory paths
    /// are resolved relative to it.
    pub fn new(root: impl Into<PathBuf>, log: Arc<dyn Logger>) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(HashMap::new()),
            root: root.into(),
            max_age: RwLock::new(DEFAULT_CACHE_MAX_AGE),
            log,
        }
    }

    /// The store's root directory. Useful when registering a whole tree
    /// while doing other work on the files inside it.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Set the max-age sent in cache-control headers. Zero disables the
    /// header entirely.
    pub async fn set_cache_max_age(&self, max_age: Duration) {
        *self.max_age.write().await = max_age;
    }

    /// Register the file at `file_path` (relative to the root) on `web_path`.
    ///
    /// With `auto_reload` the file's mtime is checked on every request and
    /// the cached copy refreshed when it changed on disk.
    pub async fn register_file(
        &self,
        file_path: &str,
        web_path: &str,
        auto_reload: bool,
    ) -> Result<()> {
        let web_path = normalize_web_path(web_path);
        let file_path = self.root.join(file_path.trim_start_matches('/'));

        self.log.debug(&format!(
            "registered file {} on {}",
            file_path.display(),
            web_path
        ));
        self.files.write().await.insert(
            web_path,
            Arc::new(Mutex::new(LazyFile::new(file_path, auto_reload))),
        );
        Ok(())
    }

    /// Register the directory at `dir_path` (relative to the root) on
    /// `web_path`.
    ///
    /// An `active` directory stats the disk on every request, picking up new
    /// files; a lazy one lists the directory once and serves that snapshot.
    pub async fn register_dir(&self, dir_path: &str, web_path: &str, active: bool) -> Result<()> {
        let web_path = normalize_web_dir(web_path);
        let dir_path = self.root.join(dir_path.trim_start_matches('/'));

        self.log.debug(&format!(
            "registered dir {} on {}",
            dir_path.display(),
            web_path
        ));
        self.dirs.write().await.insert(
            web_path.clone(),
            Arc::new(Mutex::new(LazyDir::new(dir_path, web_path, active))),
        );
        Ok(())
    }

    /// Unregister the file at `web_path`, freeing its cached content.
    pub async fn unregister_file(&self, web_path: &str) -> Result<()> {
        if self.files.write().await.remove(web_path).is_none() {
            return Err(CellError::NotRegistered(web_path.to_string()));
        }
        self.log.debug(&format!("unregistered file from {web_path}"));
        Ok(())
    }

    /// Unregister the directory at `web_path`, freeing its cached contents.
    pub async fn unregister_dir(&self, web_path: &str) -> Result<()> {
        if self.dirs.write().await.remove(web_path).is_none() {
            return Err(CellError::NotRegistered(web_path.to_string()));
        }
        self.log.debug(&format!("unregistered dir from {web_path}"));
        Ok(())
    }

    /// Serve the request if a registered file matches its path.
    ///
    /// Returns whether the request was claimed; `Ok(false)` means the
    /// request still needs handling.
    pub async fn try_handle(&self, response: &mut Response<'_>, head: &RequestHead) -> Result<bool> {
        let max_age = *self.max_age.read().await;

        let file = self.files.read().await.get(&head.path).cloned();
        if let Some(file) = file {
            file.lock().await.send(response, max_age).await?;
            return Ok(true);
        }

        let parent = parent_web_dir(&head.path);
        let dir = self.dirs.read().await.get(&parent).cloned();
        if let Some(dir) = dir {
            let found = dir.lock().await.find(&head.path).await?;
            if let Some(file) = found {
                file.lock().await.send(response, max_age).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn normalize_web_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn normalize_web_dir(path: &str) -> String {
    let mut path = normalize_web_path(path);
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

/// The parent directory of a web path, always with a trailing slash.
fn parent_web_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => format!("{}/", &path[..index]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::idle_pair;
    use crate::frame::Frame;
    use crate::logging::NullLogger;

    fn head_for(path: &str) -> RequestHead {
        RequestHead {
            method: "GET".into(),
            host: "example.com".into(),
            path: path.into(),
            remote_addr: "10.0.0.1:9999".into(),
        }
    }

    fn store_in(dir: &Path) -> Store {
        Store::new(dir, Arc::new(NullLogger))
    }

    #[test]
    fn web_path_helpers() {
        assert_eq!(normalize_web_path("style.css"), "/style.css");
        assert_eq!(normalize_web_path("/style.css"), "/style.css");
        assert_eq!(normalize_web_dir("assets"), "/assets/");
        assert_eq!(normalize_web_dir("/assets/"), "/assets/");
        assert_eq!(parent_web_dir("/assets/style.css"), "/assets/");
        assert_eq!(parent_web_dir("/style.css"), "/");
    }

    #[tokio::test]
    async fn serves_a_registered_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>hi</html>").unwrap();
        let store = store_in(dir.path());
        store
            .register_file("index.html", "/", false)
            .await
            .unwrap();

        let (channel, _cell_reader, mut queen_reader, _queen_writer) = idle_pair();
        let mut response = Response::new(&channel);
        let handled = store
            .try_handle(&mut response, &head_for("/"))
            .await
            .unwrap();
        assert!(handled);

        match queen_reader.read_frame().await.unwrap() {
            Frame::ResponseHead(sent) => {
                assert_eq!(sent.status, 200);
                assert_eq!(
                    sent.headers.get("content-type"),
                    Some(&vec!["text/html".to_string()])
                );
                assert_eq!(
                    sent.headers.get("content-length"),
                    Some(&vec!["15".to_string()])
                );
                // html is never cached
                assert!(!sent.headers.contains_key("cache-control"));
            }
            other => panic!("queen read {:?}", other.kind()),
        }
        match queen_reader.read_frame().await.unwrap() {
            Frame::ResponseBody(data) => assert_eq!(&data[..], b"<html>hi</html>"),
            other => panic!("queen read {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn unmatched_requests_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let (channel, _cell_reader, _queen_reader, _queen_writer) = idle_pair();
        let mut response = Response::new(&channel);
        let handled = store
            .try_handle(&mut response, &head_for("/missing"))
            .await
            .unwrap();
        assert!(!handled);
    }

    #[tokio::test]
    async fn cached_files_are_replayed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "console.log(1)").unwrap();
        let store = store_in(dir.path());
        store
            .register_file("app.js", "/app.js", false)
            .await
            .unwrap();

        let (channel, _cell_reader, mut queen_reader, _queen_writer) = idle_pair();

        for _ in 0..2 {
            let mut response = Response::new(&channel);
            assert!(store
                .try_handle(&mut response, &head_for("/app.js"))
                .await
                .unwrap());
        }

        // the second hit replays the cached chunks even though the file is
        // only read once; both responses carry identical frames
        for _ in 0..2 {
            match queen_reader.read_frame().await.unwrap() {
                Frame::ResponseHead(sent) => {
                    assert_eq!(
                        sent.headers.get("content-type"),
                        Some(&vec!["application/javascript".to_string()])
                    );
                    assert!(sent.headers.contains_key("cache-control"));
                }
                other => panic!("queen read {:?}", other.kind()),
            }
            match queen_reader.read_frame().await.unwrap() {
                Frame::ResponseBody(data) => assert_eq!(&data[..], b"console.log(1)"),
                other => panic!("queen read {:?}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn lazy_dir_serves_its_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/a.txt"), "alpha").unwrap();
        let store = store_in(dir.path());
        store.register_dir("assets", "/assets", false).await.unwrap();

        let (channel, _cell_reader, mut queen_reader, _queen_writer) = idle_pair();
        let mut response = Response::new(&channel);
        assert!(store
            .try_handle(&mut response, &head_for("/assets/a.txt"))
            .await
            .unwrap());

        // a file created after the listing is invisible in lazy mode
        std::fs::write(dir.path().join("assets/b.txt"), "beta").unwrap();
        let mut response = Response::new(&channel);
        assert!(!store
            .try_handle(&mut response, &head_for("/assets/b.txt"))
            .await
            .unwrap());

        match queen_reader.read_frame().await.unwrap() {
            Frame::ResponseHead(sent) => assert_eq!(sent.status, 200),
            other => panic!("queen read {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn active_dir_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        let store = store_in(dir.path());
        store.register_dir("assets", "/assets", true).await.unwrap();

        let (channel, _cell_reader, _queen_reader, _queen_writer) = idle_pair();

        let mut response = Response::new(&channel);
        assert!(!store
            .try_handle(&mut response, &head_for("/assets/new.txt"))
            .await
            .unwrap());

        std::fs::write(dir.path().join("assets/new.txt"), "fresh").unwrap();
        let mut response = Response::new(&channel);
        assert!(store
            .try_handle(&mut response, &head_for("/assets/new.txt"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn unregistering_unknown_paths_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(matches!(
            store.unregister_file("/nope").await,
            Err(CellError::NotRegistered(_))
        ));
        assert!(matches!(
            store.unregister_dir("/nope/").await,
            Err(CellError::NotRegistered(_))
        ));

        store.register_file("a", "/a", false).await.unwrap();
        store.unregister_file("/a").await.unwrap();
        assert!(store.files.read().await.is_empty());
    }
}
