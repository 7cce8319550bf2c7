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

//! # Response Recorder
//!
//! The writer every handler sees. It records the first status set (200 by
//! default) and the number of body bytes written, takes care of HTTP/1.x
//! framing (content-length, chunked, or close-delimited), and exposes the
//! optional connection capabilities as typed accessors: each returns the
//! concrete facility or a [`CapabilityError`], never an untyped cast.

use crate::error::{CapabilityError, ServeError};
use crate::middleware::status_text;
use crate::request::Headers;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::watch;

/// Object-safe connection stream, plain TCP or TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;
pub type ConnReader = BufReader<ReadHalf<BoxedStream>>;
pub type ConnWriter = WriteHalf<BoxedStream>;

/// Both halves of a connection surrendered to a handler via `hijack`.
/// The reader keeps any bytes it had already buffered.
pub struct HijackedConn {
    pub reader: ConnReader,
    pub writer: ConnWriter,
}

/// Wraps the connection for the duration of one request.
pub struct ResponseRecorder {
    writer: Option<ConnWriter>,
    reader: Option<ConnReader>,
    headers: Headers,
    status: u16,
    wrote_header: bool,
    size: u64,
    start: Instant,
    chunked: bool,
    keep_alive: bool,
    head_only: bool,
    http10: bool,
    hijacked: bool,
    close_notify: Option<watch::Receiver<bool>>,
    gzip: Option<GzEncoder<Vec<u8>>>,
}

impl ResponseRecorder {
    pub fn new(
        writer: ConnWriter,
        reader: ConnReader,
        http10: bool,
        head_only: bool,
        keep_alive: bool,
        close_notify: Option<watch::Receiver<bool>>,
    ) -> Self {
        Self {
            writer: Some(writer),
            reader: Some(reader),
            headers: Headers::new(),
            status: 0,
            wrote_header: false,
            size: 0,
            start: Instant::now(),
            chunked: false,
            keep_alive,
            head_only,
            http10,
            hijacked: false,
            close_notify,
            gzip: None,
        }
    }

    /// Routes subsequent body writes through a gzip encoder. Must be
    /// called before the header goes out; the response becomes chunked.
    pub fn enable_gzip(&mut self, level: u32) {
        if self.wrote_header || self.gzip.is_some() {
            return;
        }
        self.headers.set("Content-Encoding", "gzip");
        self.headers.add("Vary", "Accept-Encoding");
        self.gzip = Some(GzEncoder::new(Vec::new(), Compression::new(level)));
    }

    /// Response headers, writable until `write_header`.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The recorded status; 200 when none was set explicitly.
    pub fn status(&self) -> u16 {
        if self.status == 0 {
            200
        } else {
            self.status
        }
    }

    /// Body bytes written so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// When this request started being handled.
    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn wrote_header(&self) -> bool {
        self.wrote_header
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive && !self.hijacked
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// Serializes the status line and headers. Only the first call takes
    /// effect; later statuses are recorded nowhere and ignored, matching
    /// the one-status-per-response contract.
    pub async fn write_header(&mut self, status: u16) -> Result<(), ServeError> {
        if self.wrote_header || self.hijacked {
            return Ok(());
        }
        self.status = status;
        self.wrote_header = true;

        if !self.headers.contains("Date") {
            let now = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
            self.headers.set("Date", now.to_string());
        }

        if self.gzip.is_some() {
            // Whatever length an inner handler predicted no longer holds.
            self.headers.remove("Content-Length");
        }
        let bodyless = self.head_only || status == 204 || status == 304 || status < 200;
        if !bodyless && !self.headers.contains("Content-Length") {
            if self.http10 {
                // No framing available: the response is close-delimited.
                self.keep_alive = false;
            } else {
                self.chunked = true;
                self.headers.set("Transfer-Encoding", "chunked");
            }
        }
        if !self.keep_alive {
            self.headers.set("Connection", "close");
        } else if self.http10 {
            self.headers.set("Connection", "keep-alive");
        }

        let proto = if self.http10 { "HTTP/1.0" } else { "HTTP/1.1" };
        let mut head = format!("{} {} {}\r\n", proto, status, status_text(status));
        for (name, value) in self.headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.writer_mut()?.write_all(head.as_bytes()).await?;
        Ok(())
    }

    /// Writes body bytes, emitting the default 200 header first if needed.
    /// For HEAD (and bodyless statuses) bytes are counted but not sent.
    pub async fn write_body(&mut self, buf: &[u8]) -> Result<usize, ServeError> {
        if !self.wrote_header {
            self.write_header(200).await?;
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.size += buf.len() as u64;
        if self.head_only || self.status == 204 || self.status == 304 {
            return Ok(buf.len());
        }
        if let Some(encoder) = self.gzip.as_mut() {
            encoder.write_all(buf).map_err(ServeError::Io)?;
            let pending = std::mem::take(encoder.get_mut());
            self.send_raw(&pending).await?;
        } else {
            self.send_raw(buf).await?;
        }
        Ok(buf.len())
    }

    /// Writes already-encoded bytes with the response framing in effect.
    async fn send_raw(&mut self, buf: &[u8]) -> Result<(), ServeError> {
        if buf.is_empty() {
            return Ok(());
        }
        if self.chunked {
            let frame = format!("{:x}\r\n", buf.len());
            let writer = self.writer_mut()?;
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(buf).await?;
            writer.write_all(b"\r\n").await?;
        } else {
            self.writer_mut()?.write_all(buf).await?;
        }
        Ok(())
    }

    /// Completes the response framing. Called once by the server after the
    /// chain returns; handlers never call this.
    pub async fn finish(&mut self) -> Result<(), ServeError> {
        if self.hijacked {
            return Ok(());
        }
        if !self.wrote_header {
            self.headers.set("Content-Length", "0");
            self.write_header(self.status()).await?;
        }
        if let Some(encoder) = self.gzip.take() {
            let rest = encoder.finish().map_err(ServeError::Io)?;
            if !(self.head_only || self.status == 204 || self.status == 304) {
                self.send_raw(&rest).await?;
            }
        }
        if self.chunked {
            self.writer_mut()?.write_all(b"0\r\n\r\n").await?;
        }
        self.writer_mut()?.flush().await?;
        Ok(())
    }

    /// Takes over the raw connection. The response becomes the handler's
    /// responsibility; the server stops touching the socket.
    pub fn hijack(&mut self) -> Result<HijackedConn, CapabilityError> {
        if self.wrote_header {
            // Too late: framing already started.
            return Err(CapabilityError::Hijack);
        }
        match (self.reader.take(), self.writer.take()) {
            (Some(reader), Some(writer)) => {
                self.hijacked = true;
                self.keep_alive = false;
                Ok(HijackedConn { reader, writer })
            }
            (reader, writer) => {
                self.reader = reader;
                self.writer = writer;
                Err(CapabilityError::Hijack)
            }
        }
    }

    /// Flushes buffered bytes to the client.
    pub async fn flush(&mut self) -> Result<(), CapabilityError> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush().await.map_err(|_| CapabilityError::Flush),
            None => Err(CapabilityError::Flush),
        }
    }

    /// A receiver that flips to `true` when the connection is going away.
    pub fn close_notify(&self) -> Result<watch::Receiver<bool>, CapabilityError> {
        self.close_notify
            .clone()
            .ok_or(CapabilityError::CloseNotify)
    }

    /// HTTP/2 server push. Never available on an HTTP/1.x connection, but
    /// kept as a typed capability so callers can probe uniformly.
    pub fn push(&mut self, _target: &str) -> Result<(), CapabilityError> {
        Err(CapabilityError::Push)
    }

    /// Reclaims the connection halves for the next request on this
    /// connection. `None` after a hijack.
    pub(crate) fn into_conn(mut self) -> Option<(ConnReader, ConnWriter)> {
        match (self.reader.take(), self.writer.take()) {
            (Some(reader), Some(writer)) => Some((reader, writer)),
            _ => None,
        }
    }

    fn writer_mut(&mut self) -> Result<&mut ConnWriter, ServeError> {
        match self.writer.as_mut() {
            Some(writer) => Ok(writer),
            None => Err(CapabilityError::Flush.into()),
        }
    }
}
