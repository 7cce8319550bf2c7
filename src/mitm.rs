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

//! # TLS Handshake Fingerprinting
//!
//! Captures the raw ClientHello before the handshake completes and compares
//! it, per request, against published fingerprints of mainstream browsers
//! (after Durumeric et al., "The Security Impact of HTTPS Interception").
//! A mismatch between what the User-Agent claims and what the TLS stack
//! sent suggests an interception proxy re-originating the connection.
//!
//! The detector is advisory: its output is one label on the request
//! (`{mitm}` → `likely` / `unlikely` / `unknown`). Closing detected
//! connections is possible but off by default.

use crate::request::Headers;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt};

// TLS extension numbers the classifier cares about.
const EXT_STATUS_REQUEST: u16 = 5;
const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_EC_POINT_FORMATS: u16 = 11;
const EXT_HEARTBEAT: u16 = 15;

/// TLS_EMPTY_RENEGOTIATION_INFO_SCSV.
const SCSV_RENEGOTIATION: u16 = 0x00ff;

/// RC4 suites no Edge/IE build has shipped with stapling enabled.
const RC4_SUITES: [u16; 2] = [0x0005, 0xc011];

/// GREASE cipher values (RFC 8701); modern Chrome always sends one.
const GREASE_CIPHERS: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

/// Largest ClientHello record the capture will buffer.
const MAX_HELLO_LEN: usize = 16 * 1024 + 512;

/// The parsed ClientHello, order-preserving where order matters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawClientHello {
    pub version: u16,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<u16>,
    pub curves: Vec<u16>,
    pub points: Vec<u8>,
}

/// Interception likelihood for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MitmVerdict {
    Likely,
    Unlikely,
    Unknown,
}

lazy_static::lazy_static! {
    /// Captured hellos keyed by remote address. Entries are written on
    /// accept and removed when the connection closes or is hijacked.
    static ref CLIENT_HELLOS: RwLock<HashMap<SocketAddr, RawClientHello>> =
        RwLock::new(HashMap::new());
}

/// Records the hello for a connection.
pub fn remember(addr: SocketAddr, hello: RawClientHello) {
    if let Ok(mut table) = CLIENT_HELLOS.write() {
        table.insert(addr, hello);
    }
}

/// The hello captured for a connection, if any.
pub fn recall(addr: &SocketAddr) -> Option<RawClientHello> {
    CLIENT_HELLOS
        .read()
        .ok()
        .and_then(|table| table.get(addr).cloned())
}

/// Drops a connection's entry.
pub fn forget(addr: &SocketAddr) {
    if let Ok(mut table) = CLIENT_HELLOS.write() {
        table.remove(addr);
    }
}

/// Reads the first TLS record off a fresh connection and parses the
/// ClientHello in it. Returns the raw bytes consumed (so the handshake can
/// be replayed into the TLS stack) alongside the parse result.
///
/// The parse is permissive: anything that is not a well-formed ClientHello
/// yields an empty structure, never a connection error.
pub async fn capture<S>(stream: &mut S) -> std::io::Result<(Vec<u8>, RawClientHello)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if header[0] != 0x16 || record_len == 0 || record_len > MAX_HELLO_LEN {
        return Ok((header.to_vec(), RawClientHello::default()));
    }
    let mut payload = vec![0u8; record_len];
    stream.read_exact(&mut payload).await?;
    let hello = parse_client_hello(&payload);
    let mut consumed = header.to_vec();
    consumed.extend_from_slice(&payload);
    Ok((consumed, hello))
}

/// Parses a handshake-record payload into [`RawClientHello`].
pub fn parse_client_hello(payload: &[u8]) -> RawClientHello {
    parse_inner(payload).unwrap_or_default()
}

fn parse_inner(payload: &[u8]) -> Option<RawClientHello> {
    let mut r = Reader(payload);
    // Handshake header: type (must be ClientHello) and 24-bit length.
    if r.u8()? != 0x01 {
        return None;
    }
    r.skip(3)?;

    let mut hello = RawClientHello {
        version: r.u16()?,
        ..Default::default()
    };
    r.skip(32)?; // client random
    let session_len = r.u8()? as usize;
    r.skip(session_len)?;

    let cipher_len = r.u16()? as usize;
    let mut ciphers = Reader(r.take(cipher_len)?);
    while let Some(suite) = ciphers.u16() {
        hello.cipher_suites.push(suite);
    }

    let compression_len = r.u8()? as usize;
    hello.compression_methods = r.take(compression_len)?.to_vec();

    // Extensions are optional; stop cleanly if absent.
    let ext_total = match r.u16() {
        Some(len) => len as usize,
        None => return Some(hello),
    };
    let mut exts = Reader(r.take(ext_total)?);
    while let Some(ext_type) = exts.u16() {
        let ext_len = exts.u16()? as usize;
        let body = exts.take(ext_len)?;
        hello.extensions.push(ext_type);
        match ext_type {
            EXT_SUPPORTED_GROUPS => {
                let mut groups = Reader(body);
                let list_len = groups.u16().unwrap_or(0) as usize;
                if let Some(list) = groups.take(list_len) {
                    let mut list = Reader(list);
                    while let Some(curve) = list.u16() {
                        hello.curves.push(curve);
                    }
                }
            }
            EXT_EC_POINT_FORMATS => {
                let mut points = Reader(body);
                let list_len = points.u8().unwrap_or(0) as usize;
                if let Some(list) = points.take(list_len) {
                    hello.points = list.to_vec();
                }
            }
            _ => {}
        }
    }
    Some(hello)
}

/// Minimal cursor over the hello bytes; every accessor is bounds-checked
/// so truncated records fail the whole parse instead of panicking.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let (&b, rest) = self.0.split_first()?;
        self.0 = rest;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        if self.0.len() < 2 {
            return None;
        }
        let v = u16::from_be_bytes([self.0[0], self.0[1]]);
        self.0 = &self.0[2..];
        Some(v)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Some(head)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }
}

/// Classifies a request on a TLS connection. `headers` is the HTTP request
/// header set; the hello is what the same connection sent to the TLS stack.
pub fn assess(hello: &RawClientHello, headers: &Headers) -> MitmVerdict {
    // Interception products leave fingerprints in HTTP too.
    if headers.contains("X-BlueCoat-Via") || headers.contains("X-FCCKV2") {
        return MitmVerdict::Likely;
    }
    // No mainstream browser has ever advertised heartbeat.
    if hello.extensions.contains(&EXT_HEARTBEAT) {
        return MitmVerdict::Likely;
    }

    let ua = headers.get("User-Agent").unwrap_or("");
    let verdict = |ok: bool| {
        if ok {
            MitmVerdict::Unlikely
        } else {
            MitmVerdict::Likely
        }
    };

    // Order matters: Edge claims Chrome, Chrome claims Safari.
    if ua.contains("Edge") || ua.contains("MSIE") || ua.contains("Trident") {
        verdict(hello.looks_like_edge())
    } else if ua.contains("Chrome") || ua.contains("CriOS") {
        verdict(hello.looks_like_chrome())
    } else if ua.contains("Firefox") {
        if ua.contains("Windows") && matches!(firefox_major(ua), Some(45) | Some(52)) {
            // Tor Browser tracks Firefox ESR; accept either.
            verdict(hello.looks_like_firefox() || hello.looks_like_tor())
        } else {
            verdict(hello.looks_like_firefox())
        }
    } else if ua.contains("Safari") {
        verdict(hello.looks_like_safari())
    } else {
        MitmVerdict::Unknown
    }
}

/// The browser families the classifier has fingerprints for.
pub fn known_fingerprints() -> &'static [&'static str] {
    &[
        "chrome (GREASE + suite exclusions)",
        "edge/ie (stapling before curves, no RC4)",
        "firefox (NSS extension and cipher order)",
        "safari (SCSV first, SecureTransport order; iOS 11 variant)",
        "tor (Firefox ESR cipher order)",
    ]
}

/// Major version from a `Firefox/NN.N` User-Agent token.
fn firefox_major(ua: &str) -> Option<u32> {
    let rest = &ua[ua.find("Firefox/")? + "Firefox/".len()..];
    rest.split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

impl RawClientHello {
    /// Edge/IE: OCSP stapling immediately before supported groups and EC
    /// point formats, no renegotiation SCSV, no RC4.
    fn looks_like_edge(&self) -> bool {
        for (i, &ext) in self.extensions.iter().enumerate() {
            if ext == EXT_STATUS_REQUEST {
                if self.extensions.get(i + 1) != Some(&EXT_SUPPORTED_GROUPS)
                    || self.extensions.get(i + 2) != Some(&EXT_EC_POINT_FORMATS)
                {
                    return false;
                }
            }
        }
        !self.cipher_suites.iter().any(|suite| {
            *suite == SCSV_RENEGOTIATION || RC4_SUITES.contains(suite)
        })
    }

    /// Chrome: never offers the DHE/Camellia/CBC-SHA384 suites below, never
    /// curve 25, and always sends a GREASE cipher.
    fn looks_like_chrome(&self) -> bool {
        const EXCLUDED_SUITES: [u16; 8] =
            [0x0032, 0x0033, 0x0038, 0x0039, 0x0041, 0x0084, 0xc024, 0xc028];
        if self
            .cipher_suites
            .iter()
            .any(|suite| EXCLUDED_SUITES.contains(suite))
        {
            return false;
        }
        if self.curves.contains(&25) {
            return false;
        }
        self.has_grease_ciphers()
    }

    /// Firefox: a fixed relative extension order, the exact NSS curve list,
    /// no GREASE, and the NSS cipher preference order.
    fn looks_like_firefox(&self) -> bool {
        const EXTENSION_ORDER: [u16; 8] = [23, 65281, 10, 11, 35, 16, 5, 13];
        if !contains_in_order(&EXTENSION_ORDER, &self.extensions) {
            return false;
        }
        const CURVES: [u16; 4] = [29, 23, 24, 25];
        if self.curves != CURVES {
            return false;
        }
        if self.has_grease_ciphers() {
            return false;
        }
        const CIPHER_ORDER: [u16; 13] = [
            0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a, 0xc009, 0xc013, 0xc014,
            0x002f, 0x0035, 0x000a,
        ];
        contains_in_order(&CIPHER_ORDER, &self.cipher_suites)
    }

    /// Tor Browser (Firefox ESR lineage): the ESR cipher preference order.
    fn looks_like_tor(&self) -> bool {
        const CIPHER_ORDER: [u16; 11] = [
            0xc02b, 0xc02f, 0xc02c, 0xc030, 0xc00a, 0xc009, 0xc013, 0xc014, 0x002f, 0x0035,
            0x000a,
        ];
        contains_in_order(&CIPHER_ORDER, &self.cipher_suites)
    }

    /// Safari: renegotiation SCSV leads the cipher list, then the
    /// SecureTransport preference order; an alternate iOS 11 order is also
    /// accepted.
    fn looks_like_safari(&self) -> bool {
        match self.cipher_suites.first() {
            Some(&SCSV_RENEGOTIATION) => {}
            _ => return false,
        }
        const CIPHER_ORDER: [u16; 18] = [
            0xc02c, 0xc02b, 0xc024, 0xc023, 0xc00a, 0xc009, 0xc030, 0xc02f, 0xc028, 0xc027,
            0xc014, 0xc013, 0x009d, 0x009c, 0x003d, 0x003c, 0x0035, 0x002f,
        ];
        const CIPHER_ORDER_IOS11: [u16; 12] = [
            0xc02c, 0xc02b, 0xc030, 0xc02f, 0xc024, 0xc023, 0xc028, 0xc027, 0xc00a, 0xc009,
            0xc014, 0xc013,
        ];
        contains_in_order(&CIPHER_ORDER, &self.cipher_suites[1..])
            || contains_in_order(&CIPHER_ORDER_IOS11, &self.cipher_suites[1..])
    }

    fn has_grease_ciphers(&self) -> bool {
        self.cipher_suites
            .iter()
            .any(|suite| GREASE_CIPHERS.contains(suite))
    }
}

/// Every item of `required` occurs in `have`, in the same relative order.
fn contains_in_order(required: &[u16], have: &[u16]) -> bool {
    let mut have = have.iter();
    required
        .iter()
        .all(|item| have.any(|candidate| candidate == item))
}
