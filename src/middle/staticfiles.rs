// Copyright (c) 2024, The Parapet Project Authors.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright
//       notice, this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above
//       copyright notice, this list of conditions and the following disclaimer
//       in the documentation and/or other materials provided with the
//       distribution.
//
//     * Neither the name of the copyright holder nor the names of its
//       contributors may be used to endorse or promote products derived from
//       this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! # Static File Handler
//!
//! The terminal handler of every chain: serves the site root from disk,
//! resolves directory indexes, refuses hidden paths, and emits validator
//! headers so conditional requests short-circuit.

use crate::middleware::{Handler, ServeResult};
use crate::pathmatch;
use crate::recorder::ResponseRecorder;
use crate::replacer::percent_decode;
use crate::request::{Method, Request};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;
use tokio::io::AsyncReadExt;

/// Files tried, in order, when a directory is requested.
pub const INDEX_FILES: [&str; 2] = ["index.html", "index.htm"];

const STREAM_CHUNK: usize = 32 * 1024;

pub struct StaticFiles {
    root: PathBuf,
    hide: Vec<String>,
    case_sensitive: bool,
}

impl StaticFiles {
    pub fn new(root: PathBuf, hide: Vec<String>, case_sensitive: bool) -> Self {
        Self {
            root,
            hide,
            case_sensitive,
        }
    }

    /// A path is hidden when a hide entry matches it as a prefix (entries
    /// with slashes) or names one of its segments (bare entries like
    /// `.git`).
    fn is_hidden(&self, rel: &str) -> bool {
        self.hide.iter().any(|entry| {
            if entry.contains('/') {
                pathmatch::matches(rel, entry, self.case_sensitive)
            } else {
                rel.split('/').any(|seg| seg == entry)
            }
        })
    }
}

#[async_trait]
impl Handler for StaticFiles {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        if !matches!(r.method, Method::Get | Method::Head) {
            w.headers_mut().set("Allow", "GET, HEAD");
            return Ok(405);
        }

        let rel = pathmatch::clean(&percent_decode(r.url.path()));
        if self.is_hidden(&rel) {
            return Ok(404);
        }

        let mut fs_path = self.root.join(rel.trim_start_matches('/'));
        let mut meta = match tokio::fs::metadata(&fs_path).await {
            Ok(meta) => meta,
            Err(e) => return Ok(not_found_status(&e)),
        };

        if meta.is_dir() {
            // Canonical directory URLs end in a slash.
            if !r.url.path().ends_with('/') {
                let mut location = r.url.path().to_string();
                location.push('/');
                if let Some(query) = r.url.query() {
                    location.push('?');
                    location.push_str(query);
                }
                w.headers_mut().set("Location", location);
                w.write_header(301).await?;
                return Ok(0);
            }
            let mut index = None;
            for name in INDEX_FILES {
                let candidate = fs_path.join(name);
                if let Ok(m) = tokio::fs::metadata(&candidate).await {
                    if m.is_file() {
                        index = Some((candidate, m));
                        break;
                    }
                }
            }
            match index {
                Some((path, m)) => {
                    fs_path = path;
                    meta = m;
                }
                None => return Ok(404),
            }
        }

        let size = meta.len();
        let modified = meta.modified().ok();
        let etag = modified.map(|m| {
            let secs = m.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
            format!("\"{:x}-{:x}\"", secs, size)
        });

        if let (Some(etag), Some(inm)) = (&etag, r.headers.get("If-None-Match")) {
            if inm.split(',').any(|candidate| candidate.trim() == etag) {
                w.write_header(304).await?;
                return Ok(0);
            }
        }

        if let Some(etag) = &etag {
            w.headers_mut().set("ETag", etag.clone());
        }
        if let Some(modified) = modified {
            let when = chrono::DateTime::<chrono::Utc>::from(modified)
                .format("%a, %d %b %Y %H:%M:%S GMT");
            w.headers_mut().set("Last-Modified", when.to_string());
        }
        if !w.headers().contains("Content-Type") {
            if let Some(mime) = content_type_for(&fs_path) {
                w.headers_mut().set("Content-Type", mime);
            }
        }
        w.headers_mut().set("Content-Length", size.to_string());
        w.write_header(200).await?;

        if matches!(r.method, Method::Get) {
            let mut file = match tokio::fs::File::open(&fs_path).await {
                Ok(file) => file,
                Err(e) => return Err(e.into()),
            };
            let mut buf = vec![0u8; STREAM_CHUNK];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                w.write_body(&buf[..n]).await?;
            }
        }
        Ok(0)
    }
}

fn not_found_status(e: &std::io::Error) -> u16 {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => 403,
        _ => 404,
    }
}

/// Content type by file extension; unknown extensions get no header and
/// the client sniffs.
pub fn content_type_for(path: &std::path::Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?;
    Some(match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" | "md" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        _ => return None,
    })
}
