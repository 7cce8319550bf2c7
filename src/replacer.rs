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

//! # Placeholder Replacer
//!
//! Materializes `{placeholder}` tokens against request and response state
//! on demand. Custom values set by handlers take precedence over every
//! built-in key; header, cookie and query sigils (`{>H}`, `{<H}`, `{~c}`,
//! `{?q}`) come next, then the well-known key set. Original-URL keys
//! (`{path}`, `{uri}`, `{query}`, `{fragment}`) read the URL stashed at
//! server entry so rewrites cannot change their meaning; the `rewrite_*`
//! variants read the live URL.

use crate::mitm::MitmVerdict;
use crate::recorder::ResponseRecorder;
use crate::request::{Method, Request};
use std::collections::HashMap;
use std::time::Duration;

/// How much of a request body `{request_body}` may capture. The cap bounds
/// log output; handlers always see the whole body.
pub const MAX_LOG_BODY_SIZE: usize = 100 * 1024;

/// Per-request substitution engine. One lives in each request's context.
#[derive(Debug, Clone, Default)]
pub struct Replacer {
    custom: HashMap<String, String>,
    empty_value: String,
}

impl Replacer {
    pub fn new(empty_value: impl Into<String>) -> Self {
        Self {
            custom: HashMap::new(),
            empty_value: empty_value.into(),
        }
    }

    /// Registers a custom substitution for `{key}`. Takes precedence over
    /// all built-ins.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom.insert(key.into(), value.into());
    }

    /// Substitutes every `{...}` token in `s`, using this replacer's empty
    /// value for unmatched tokens.
    pub fn replace(&self, s: &str, req: &Request, resp: Option<&ResponseRecorder>) -> String {
        self.replace_with(s, req, resp, &self.empty_value)
    }

    /// Like [`replace`](Self::replace) with an explicit empty value, for
    /// callers with their own convention (the log handler uses `-`).
    pub fn replace_with(
        &self,
        s: &str,
        req: &Request,
        resp: Option<&ResponseRecorder>,
        empty_value: &str,
    ) -> String {
        if !s.contains('{') {
            return s.to_string();
        }
        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            match rest[open..].find('}') {
                Some(close) => {
                    let key = &rest[open + 1..open + close];
                    match self.substitution(key, req, resp) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(empty_value),
                    }
                    rest = &rest[open + close + 1..];
                }
                None => {
                    // Unterminated token: emit the tail verbatim.
                    out.push_str(&rest[open..]);
                    return out;
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn substitution(
        &self,
        key: &str,
        req: &Request,
        resp: Option<&ResponseRecorder>,
    ) -> Option<String> {
        if let Some(value) = self.custom.get(key) {
            return Some(value.clone());
        }

        // Sigil-prefixed lookups into headers, cookies and query params.
        if let Some(name) = key.strip_prefix('>') {
            let joined = req.headers.get_all(name).collect::<Vec<_>>().join(",");
            return if joined.is_empty() { None } else { Some(joined) };
        }
        if let Some(name) = key.strip_prefix('<') {
            return resp.and_then(|r| r.headers().get(name)).map(str::to_string);
        }
        if let Some(name) = key.strip_prefix('~') {
            return req.cookie(name).map(str::to_string);
        }
        if let Some(name) = key.strip_prefix('?') {
            return req.query_param(name);
        }

        let original = &req.ctx.original_url;
        match key {
            "method" => Some(req.method.to_string()),
            "scheme" => Some(original.scheme().to_string()),
            "host" => Some(req.host().to_string()),
            "hostonly" => Some(req.host_only().to_string()),
            "hostname" => sysinfo::System::host_name(),
            "port" => {
                let (_, port) = crate::address::split_host_port(req.host());
                port
            }
            "remote" => Some(req.remote_addr.ip().to_string()),
            "proto" => Some(req.proto.clone()),
            "path" => Some(percent_decode(original.path())),
            "path_escaped" => Some(query_escape(&percent_decode(original.path()))),
            "rewrite_path" => Some(percent_decode(req.url.path())),
            "rewrite_path_escaped" => Some(query_escape(&percent_decode(req.url.path()))),
            "query" => Some(original.query().unwrap_or("").to_string()),
            "query_escaped" => Some(query_escape(original.query().unwrap_or(""))),
            "fragment" => Some(original.fragment().unwrap_or("").to_string()),
            "uri" => Some(request_uri(original)),
            "uri_escaped" => Some(query_escape(&request_uri(original))),
            "rewrite_uri" => Some(request_uri(&req.url)),
            "rewrite_uri_escaped" => Some(query_escape(&request_uri(&req.url))),
            "file" => {
                let path = percent_decode(original.path());
                Some(path.rsplit('/').next().unwrap_or("").to_string())
            }
            "dir" => {
                let path = percent_decode(original.path());
                match path.rfind('/') {
                    Some(idx) => Some(path[..=idx].to_string()),
                    None => Some(path),
                }
            }
            "when" => Some(chrono::Local::now().format("%d/%b/%Y:%H:%M:%S %z").to_string()),
            "when_iso" => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            "when_unix" => Some(chrono::Utc::now().timestamp().to_string()),
            "request" => Some(dump_request(req)),
            "request_body" => request_body(req),
            "request_id" => Some(req.ctx.request_id.clone()),
            "user" => req.ctx.remote_user.clone(),
            "mitm" => req.ctx.mitm.map(|verdict| {
                match verdict {
                    MitmVerdict::Likely => "likely",
                    MitmVerdict::Unlikely => "unlikely",
                    MitmVerdict::Unknown => "unknown",
                }
                .to_string()
            }),
            "status" => resp.map(|r| r.status().to_string()),
            "size" => resp.map(|r| r.size().to_string()),
            "latency" => resp.map(|r| format!("{:?}", round_latency(r.start().elapsed()))),
            "latency_ms" => resp.map(|r| r.start().elapsed().as_millis().to_string()),
            _ => None,
        }
    }
}

/// `path?query` of a URL, as transmitted.
fn request_uri(url: &url::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// The request head as a single log-safe line: CR and LF are escaped so one
/// request stays on one line.
fn dump_request(req: &Request) -> String {
    let mut out = format!(
        "{} {} {}\r\n",
        req.method,
        request_uri(&req.ctx.original_url),
        req.proto
    );
    for (name, value) in req.headers.iter() {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out.replace('\r', "\\r").replace('\n', "\\n")
}

/// Body capture for `{request_body}`: POST/PUT with a JSON or XML content
/// type only, bounded by [`MAX_LOG_BODY_SIZE`].
fn request_body(req: &Request) -> Option<String> {
    if !matches!(req.method, Method::Post | Method::Put) {
        return None;
    }
    let content_type = req.headers.get("Content-Type")?;
    if !content_type.contains("json") && !content_type.contains("xml") {
        return None;
    }
    let cap = req.body.len().min(MAX_LOG_BODY_SIZE);
    Some(String::from_utf8_lossy(&req.body[..cap]).into_owned())
}

/// Rounds for display: millisecond granularity past 1ms, else microsecond.
fn round_latency(d: Duration) -> Duration {
    if d >= Duration::from_millis(1) {
        Duration::from_millis(d.as_millis() as u64)
    } else {
        Duration::from_micros(d.as_micros() as u64)
    }
}

/// Decodes `%XX` escapes; leaves malformed escapes untouched.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &s[i + 1..i + 3];
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Escapes a string for use inside a query component: unreserved characters
/// pass through, space becomes `+`, everything else is `%XX`.
pub fn query_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
