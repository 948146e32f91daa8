//! Lazily cached directories.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::store::LazyFile;
use crate::types::Result;

/// A directory of [`LazyFile`]s.
///
/// In lazy mode the directory is listed once and only that snapshot is ever
/// served. In active mode every request stats the disk, so files that
/// appear later are picked up and entries for vanished files are dropped.
pub struct LazyDir {
    dir_path: PathBuf,
    web_path: String,
    active: bool,

    items: Option<HashMap<String, Arc<Mutex<LazyFile>>>>,
}

impl LazyDir {
    pub fn new(dir_path: PathBuf, web_path: String, active: bool) -> Self {
        Self {
            dir_path,
            web_path,
            active,
            items: None,
        }
    }

    /// The file registered under `web_path`, if this directory has one.
    pub(crate) async fn find(&mut self, web_path: &str) -> Result<Option<Arc<Mutex<LazyFile>>>> {
        if self.active {
            self.find_active(web_path).await
        } else {
            self.find_lazy(web_path).await
        }
    }

    /// Serve only what was on disk when the directory was first listed.
    async fn find_lazy(&mut self, web_path: &str) -> Result<Option<Arc<Mutex<LazyFile>>>> {
        if self.items.is_none() {
            let mut items = HashMap::new();
            let mut entries = tokio::fs::read_dir(&self.dir_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                items.insert(
                    format!("{}{}", self.web_path, name),
                    Arc::new(Mutex::new(LazyFile::new(entry.path(), false))),
                );
            }
            self.items = Some(items);
        }

        Ok(self.items.as_ref().and_then(|items| items.get(web_path).cloned()))
    }

    /// Stat the disk for the requested name, updating the item map as files
    /// come and go.
    async fn find_active(&mut self, web_path: &str) -> Result<Option<Arc<Mutex<LazyFile>>>> {
        let name = match web_path.rsplit('/').next() {
            Some(name) if !name.is_empty() => name,
            _ => return Ok(None),
        };
        let file_path = self.dir_path.join(name);

        let exists = match tokio::fs::metadata(&file_path).await {
            Ok(metadata) => !metadata.is_dir(),
            Err(_) => false,
        };
        if !exists {
            if let Some(items) = &mut self.items {
                items.remove(web_path);
            }
            return Ok(None);
        }

        let items = self.items.get_or_insert_with(HashMap::new);
        if let Some(file) = items.get(web_path) {
            return Ok(Some(file.clone()));
        }

        let file = Arc::new(Mutex::new(LazyFile::new(file_path, true)));
        items.insert(web_path.to_string(), file.clone());
        Ok(Some(file))
    }
}
