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

//! # Request Model
//!
//! The crate's own HTTP request representation: method, header multimap,
//! live and original URLs, the eagerly-read body, and the typed per-request
//! context shared between handlers. Parapet is not a general HTTP library;
//! these types exist to serve the dispatch core.

use crate::error::ServeError;
use crate::mitm::MitmVerdict;
use crate::pathmatch;
use crate::replacer::Replacer;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use url::Url;

/// Default cap on buffered request bodies, in bytes.
pub const DEFAULT_MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// Default cap on the request head (request line plus headers), in bytes.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Other(s) => s,
        }
    }
}

impl std::str::FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            other => Method::Other(other.to_string()),
        })
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered, case-insensitive header multimap.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a value, keeping any existing ones.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replaces all values for `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-request state shared across the handler chain.
///
/// This is a closed set: handlers communicate through these typed fields
/// and must not invent ad-hoc keys.
#[derive(Debug)]
pub struct RequestContext {
    /// Unique id for this request, exposed as `{request_id}`.
    pub request_id: String,
    /// Immutable copy of the URL as it arrived, before any rewrite.
    pub original_url: Url,
    /// Authenticated user, set by the auth handler.
    pub remote_user: Option<String>,
    /// Interception verdict from the TLS fingerprint classifier.
    pub mitm: Option<MitmVerdict>,
    /// The per-request placeholder engine.
    pub replacer: Replacer,
    /// When the server began handling this request.
    pub received_at: Instant,
}

/// A fully-read HTTP request.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// The protocol as sent, e.g. `HTTP/1.1`.
    pub proto: String,
    /// The live URL; rewrite handlers mutate this.
    pub url: Url,
    pub headers: Headers,
    pub remote_addr: SocketAddr,
    pub body: Vec<u8>,
    pub ctx: RequestContext,
}

impl Request {
    /// The `Host` header value as sent (may include a port).
    pub fn host(&self) -> &str {
        self.headers.get("Host").unwrap_or("")
    }

    /// Host without the port; falls back to the full `Host` value when it
    /// cannot be split.
    pub fn host_only(&self) -> &str {
        let host = self.host();
        if let Some(end) = host.rfind(']') {
            return &host[..=end];
        }
        match host.rfind(':') {
            Some(idx) if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &host[..idx],
            _ => host,
        }
    }

    /// Named cookie value from the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        for header in self.headers.get_all("Cookie") {
            for pair in header.split(';') {
                let pair = pair.trim();
                if let Some((k, v)) = pair.split_once('=') {
                    if k == name {
                        return Some(v);
                    }
                }
            }
        }
        None
    }

    /// First query parameter named `name` from the live URL.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Whether the connection should stay open after this request.
    pub fn wants_keep_alive(&self) -> bool {
        let conn = self.headers.get("Connection").unwrap_or("");
        if conn.eq_ignore_ascii_case("close") {
            return false;
        }
        if self.proto == "HTTP/1.0" {
            return conn.eq_ignore_ascii_case("keep-alive");
        }
        true
    }
}

/// Limits applied while reading a request off the wire.
#[derive(Debug, Clone, Copy)]
pub struct ReadLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_REQUEST_BODY,
        }
    }
}

/// Reads one request from the connection.
///
/// Returns `Ok(None)` on a clean EOF before any bytes of a new request, so
/// keep-alive loops can distinguish "client went away" from a parse error.
pub async fn read_request<R>(
    reader: &mut BufReader<R>,
    remote_addr: SocketAddr,
    secure: bool,
    limits: ReadLimits,
) -> Result<Option<Request>, ServeError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    loop {
        let mut line = Vec::with_capacity(128);
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        head.extend_from_slice(&line);
        if head.len() > limits.max_header_bytes {
            return Err(ServeError::Protocol("request head too large".to_string()));
        }
        if line == b"\r\n" || line == b"\n" {
            // Skip leading blank lines before the request line.
            if head == b"\r\n" || head == b"\n" {
                head.clear();
                continue;
            }
            break;
        }
    }

    let mut header_buf = [httparse::EMPTY_HEADER; 96];
    let mut parsed = httparse::Request::new(&mut header_buf);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) | Err(_) => {
            return Err(ServeError::Protocol("malformed request head".to_string()));
        }
    }

    let method: Method = parsed.method.unwrap_or("GET").parse().unwrap_or(Method::Get);
    let target = parsed.path.unwrap_or("/").to_string();
    let proto = format!("HTTP/1.{}", parsed.version.unwrap_or(1));

    let mut headers = Headers::new();
    for h in parsed.headers.iter() {
        headers.add(h.name, String::from_utf8_lossy(h.value).into_owned());
    }

    let body = read_body(reader, &method, &headers, limits.max_body_bytes).await?;
    let url = request_url(&target, headers.get("Host"), secure);

    Ok(Some(Request {
        method,
        proto,
        ctx: RequestContext {
            request_id: uuid::Uuid::new_v4().to_string(),
            original_url: url.clone(),
            remote_user: None,
            mitm: None,
            replacer: Replacer::default(),
            received_at: Instant::now(),
        },
        url,
        headers,
        remote_addr,
        body,
    }))
}

/// Builds the request URL from the target and `Host` header. The path is
/// cleaned on entry (masking `://` for proxied absolute targets).
fn request_url(target: &str, host: Option<&str>, secure: bool) -> Url {
    let scheme = if secure { "https" } else { "http" };
    if target.starts_with("http://") || target.starts_with("https://") {
        if let Ok(url) = Url::parse(target) {
            return url;
        }
    }
    let host = match host {
        Some(h) if !h.is_empty() => h,
        _ => "localhost",
    };
    let (path, rest) = match target.find(|c| c == '?' || c == '#') {
        Some(idx) => (&target[..idx], &target[idx..]),
        None => (target, ""),
    };
    let cleaned = pathmatch::clean_request_path(path);
    let full = format!("{}://{}{}{}", scheme, host, cleaned, rest);
    Url::parse(&full).unwrap_or_else(|_| {
        // A hostile Host header should not take the request down with it.
        Url::parse(&format!("{}://localhost/", scheme)).unwrap()
    })
}

async fn read_body<R>(
    reader: &mut BufReader<R>,
    method: &Method,
    headers: &Headers,
    max: usize,
) -> Result<Vec<u8>, ServeError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    if matches!(*method, Method::Get | Method::Head | Method::Trace) {
        // Bodies on these methods are ignored unless explicitly framed.
        if headers.get("Content-Length").is_none() && headers.get("Transfer-Encoding").is_none() {
            return Ok(Vec::new());
        }
    }

    if let Some(te) = headers.get("Transfer-Encoding") {
        if te.to_ascii_lowercase().contains("chunked") {
            return read_chunked_body(reader, max).await;
        }
    }

    let len = headers
        .get("Content-Length")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if len == 0 {
        return Ok(Vec::new());
    }
    if len > max {
        return Err(ServeError::MaxBodyExceeded(max));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_chunked_body<R>(
    reader: &mut BufReader<R>,
    max: usize,
) -> Result<Vec<u8>, ServeError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut size_line = Vec::new();
        reader.read_until(b'\n', &mut size_line).await?;
        let size_str = String::from_utf8_lossy(&size_line);
        let size_str = size_str.trim().split(';').next().unwrap_or("0");
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ServeError::Protocol("malformed chunk size".to_string()))?;
        if size == 0 {
            // Trailers, then the final CRLF.
            loop {
                let mut trailer = Vec::new();
                let n = reader.read_until(b'\n', &mut trailer).await?;
                if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
                    break;
                }
            }
            return Ok(body);
        }
        if body.len() + size > max {
            return Err(ServeError::MaxBodyExceeded(max));
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
}
