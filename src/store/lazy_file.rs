//! Lazily cached files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::http::Response;
use crate::types::Result;

/* The chunk size is not chunked encoding; streaming in pieces just lets the
 * queen start forwarding before the whole file is read. It must be at least
 * 512 for content sniffing to see enough of the file. */
const CHUNK_SIZE: usize = 1024;

/// A file served from an in-memory cache, loaded the first time it is
/// requested.
pub struct LazyFile {
    path: PathBuf,
    auto_reload: bool,

    mime: String,
    chunks: Option<Vec<Bytes>>,
    modified: Option<SystemTime>,
    total_size: u64,
}

impl LazyFile {
    pub fn new(path: PathBuf, auto_reload: bool) -> Self {
        Self {
            path,
            auto_reload,
            mime: String::new(),
            chunks: None,
            modified: None,
            total_size: 0,
        }
    }

    /// Serve the file, loading it from disk if it is not cached yet.
    pub(crate) async fn send(&mut self, response: &mut Response<'_>, max_age: Duration) -> Result<()> {
        if self.auto_reload {
            let modified = tokio::fs::metadata(&self.path).await?.modified()?;
            if self.modified.is_some_and(|previous| modified > previous) {
                self.chunks = None;
            }
            self.modified = Some(modified);
        }

        if self.chunks.is_none() {
            return self.load_and_send(response, max_age).await;
        }

        self.send_headers(response, max_age).await?;
        if let Some(chunks) = &self.chunks {
            for chunk in chunks {
                response.write_body(chunk).await?;
            }
        }
        Ok(())
    }

    async fn send_headers(&self, response: &mut Response<'_>, max_age: Duration) -> Result<()> {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), vec![self.mime.clone()]);
        headers.insert(
            "content-length".to_string(),
            vec![self.total_size.to_string()],
        );
        if max_age > Duration::ZERO && !self.mime.starts_with("text/html") {
            headers.insert(
                "cache-control".to_string(),
                vec![format!("max-age={}", max_age.as_secs())],
            );
        }
        response.write_head(200, Some(headers)).await
    }

    /// Load the file from disk while streaming it out, then keep the chunks
    /// for the next request.
    async fn load_and_send(&mut self, response: &mut Response<'_>, max_age: Duration) -> Result<()> {
        let mut file = File::open(&self.path).await?;
        self.total_size = file.metadata().await?.len();

        let mut chunks = Vec::new();
        let mut sent_headers = false;
        loop {
            let mut buf = vec![0u8; CHUNK_SIZE];
            let filled = read_full(&mut file, &mut buf).await?;
            buf.truncate(filled);
            let chunk = Bytes::from(buf);
            let ended = filled < CHUNK_SIZE;

            if !sent_headers {
                sent_headers = true;
                self.mime = sniff_mime(&self.path, &chunk);
                self.send_headers(response, max_age).await?;
            }

            if !chunk.is_empty() {
                response.write_body(&chunk).await?;
                chunks.push(chunk);
            }
            if ended {
                break;
            }
        }
        self.chunks = Some(chunks);
        Ok(())
    }
}

/// Fill `buf` as far as the file allows; a short count means end of file.
async fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Best-effort content type from file contents plus extension.
///
/// Content sniffing reports plain text for any text-ish file, which is only
/// right when the file really is a text file; known extensions override it.
fn sniff_mime(path: &Path, data: &[u8]) -> String {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let detected = detect_content_type(data);

    let wrong_type =
        detected.starts_with("text/plain") && !extension.is_empty() && extension != "txt";
    if !wrong_type {
        return detected.to_string();
    }

    match extension {
        "svg" => "image/svg+xml".to_string(),
        "js" | "mjs" => "application/javascript".to_string(),
        "json" => "application/json".to_string(),
        "css" => "text/css".to_string(),
        "html" | "htm" => "text/html".to_string(),
        "xml" => "text/xml".to_string(),
        other => format!("text/{other}"),
    }
}

fn detect_content_type(data: &[u8]) -> &'static str {
    const HTML_MARKERS: [&[u8]; 4] = [b"<!DOCTYPE html", b"<!doctype html", b"<html", b"<HTML"];

    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return "image/png";
    }
    if data.starts_with(b"\xff\xd8\xff") {
        return "image/jpeg";
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    if data.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if data.starts_with(b"PK\x03\x04") {
        return "application/zip";
    }
    if data.starts_with(b"wOFF") {
        return "font/woff";
    }
    if data.starts_with(b"wOF2") {
        return "font/woff2";
    }

    let trimmed = trim_leading_whitespace(data);
    if HTML_MARKERS.iter().any(|marker| trimmed.starts_with(marker)) {
        return "text/html";
    }

    if std::str::from_utf8(data).is_ok() {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

fn trim_leading_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(data.len());
    &data[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_overrides_plain_text() {
        assert_eq!(
            sniff_mime(Path::new("app.js"), b"console.log(1)"),
            "application/javascript"
        );
        assert_eq!(
            sniff_mime(Path::new("icon.svg"), b"<svg xmlns=\"x\"/>"),
            "image/svg+xml"
        );
        assert_eq!(sniff_mime(Path::new("main.css"), b"body {}"), "text/css");
        assert_eq!(
            sniff_mime(Path::new("notes.txt"), b"plain notes"),
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn content_beats_extension_for_binary_types() {
        assert_eq!(
            sniff_mime(Path::new("image.whatever"), b"\x89PNG\r\n\x1a\nrest"),
            "image/png"
        );
        assert_eq!(
            sniff_mime(Path::new("doc"), b"%PDF-1.7 ..."),
            "application/pdf"
        );
    }

    #[test]
    fn html_is_detected_from_content() {
        assert_eq!(
            detect_content_type(b"  <!DOCTYPE html><html></html>"),
            "text/html"
        );
    }

    #[test]
    fn unknown_binary_falls_back_to_octet_stream() {
        assert_eq!(
            detect_content_type(&[0x00, 0xff, 0xfe, 0x01]),
            "application/octet-stream"
        );
    }
}
