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

//! # Listener Groups and the Serve Loop
//!
//! Sites are grouped by their resolved bind address; each group becomes one
//! `HttpServer` with merged timeouts, one optional TLS config, and a
//! virtual-host trie of compiled handler chains. The request entry point
//! cleans the URL, annotates the request context, resolves the site,
//! recovers panics into 500s, and renders the default error body for
//! unwritten `status >= 400` returns.

use crate::config::RuntimeConfig;
use crate::error::ServeError;
use crate::middle::staticfiles::StaticFiles;
use crate::middleware::{self, HandlerRef};
use crate::mitm::{self, MitmVerdict};
use crate::recorder::{BoxedStream, ResponseRecorder};
use crate::request::{self, ReadLimits};
use crate::site::{self, EffectiveTimeouts, SiteConfig};
use crate::telemetry;
use crate::tls::{self, PrefixedStream, RotatingTicketer};
use crate::vhost::VHostTrie;
use futures::FutureExt;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};

/// Process-wide connection tracker, decremented as connections close so
/// tests (and `stop`) can observe quiescence.
pub struct ConnTracker {
    count: AtomicUsize,
    notify: Notify,
}

impl ConnTracker {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn active(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Waits until no connections remain, or the timeout passes.
    pub async fn wait_idle(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, async {
            while self.active() > 0 {
                self.notify.notified().await;
            }
        })
        .await;
    }
}

lazy_static::lazy_static! {
    pub static ref CONNECTIONS: ConnTracker = ConnTracker {
        count: AtomicUsize::new(0),
        notify: Notify::new(),
    };
}

/// One compiled site as the serve loop sees it.
struct SiteRuntime {
    handler: HandlerRef,
    close_on_mitm: bool,
}

/// One listener with everything shared by the sites bound to it.
pub struct HttpServer {
    pub addr: String,
    vhosts: VHostTrie<Arc<SiteRuntime>>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    ticketer: Option<Arc<RotatingTicketer>>,
    timeouts: EffectiveTimeouts,
    limits: ReadLimits,
    closing: watch::Sender<bool>,
}

/// Groups sites by bind address and builds one server per group.
///
/// This is where `duplicate-site` is caught: two sites canonicalizing to
/// the same vhost key cannot both be compiled, and trie insertion itself
/// never fails.
pub fn build_servers(
    sites: Vec<SiteConfig>,
    runtime: &RuntimeConfig,
) -> Result<Vec<Arc<HttpServer>>, ServeError> {
    let mut groups: Vec<(String, Vec<SiteConfig>)> = Vec::new();
    for mut site in sites {
        // A site on a loopback host should not listen on every interface
        // unless told to.
        if site.listen_host.is_empty() && is_loopback(&site.addr.host) {
            site.listen_host = site.addr.host.clone();
        }
        if site.addr.port.is_empty() {
            site.addr.port = runtime.default_port.clone();
        }
        let bind = listen_addr(&site.listen_host, &site.addr.port);
        match groups.iter_mut().find(|(addr, _)| *addr == bind) {
            Some((_, members)) => members.push(site),
            None => groups.push((bind, vec![site])),
        }
    }

    let mut servers = Vec::new();
    for (bind, members) in groups {
        let with_tls = members.iter().filter(|s| s.tls.is_some()).count();
        if with_tls != 0 && with_tls != members.len() {
            return Err(ServeError::Config(format!(
                "listener {} mixes TLS and plain sites",
                bind
            )));
        }

        let timeouts = site::merge_timeouts(members.iter().map(|s| &s.timeouts));
        let limits = ReadLimits {
            max_header_bytes: site::merge_size_cap(
                members.iter().map(|s| s.max_header_bytes),
            )
            .unwrap_or(request::DEFAULT_MAX_HEADER_BYTES),
            max_body_bytes: site::merge_size_cap(
                members.iter().map(|s| s.max_body_bytes),
            )
            .unwrap_or(request::DEFAULT_MAX_REQUEST_BODY),
        };

        let ticketer = if with_tls > 0 {
            Some(RotatingTicketer::new()?)
        } else {
            None
        };
        let tls_config = match &ticketer {
            Some(ticketer) => {
                tls::build_server_config(&members.iter().collect::<Vec<_>>(), ticketer.clone())?
            }
            None => None,
        };

        let mut vhosts = VHostTrie::new();
        let mut seen_keys: Vec<String> = Vec::new();
        for mut member in members {
            let key = member.addr.vhost_key().to_lowercase();
            if seen_keys.contains(&key) {
                return Err(ServeError::DuplicateSite(member.addr.original.clone()));
            }
            seen_keys.push(key.clone());

            let terminal: HandlerRef = Arc::new(StaticFiles::new(
                member.root.clone(),
                member.hidden.clone(),
                runtime.case_sensitive_path,
            ));
            let factories = std::mem::take(&mut member.middleware);
            let handler = middleware::compile(factories, terminal);
            vhosts.insert(
                &key,
                Arc::new(SiteRuntime {
                    handler,
                    close_on_mitm: member.close_on_mitm,
                }),
            );
        }

        let (closing, _) = watch::channel(false);
        servers.push(Arc::new(HttpServer {
            addr: bind,
            vhosts,
            tls_config,
            ticketer,
            timeouts,
            limits,
            closing,
        }));
    }
    Ok(servers)
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]")
}

fn listen_addr(host: &str, port: &str) -> String {
    if host.is_empty() {
        return format!("0.0.0.0:{}", port);
    }
    if host.contains(':') && !host.starts_with('[') {
        return format!("[{}]:{}", host, port);
    }
    format!("{}:{}", host, port)
}

/// Binds with SO_REUSEADDR so restarts do not trip over TIME_WAIT.
fn bind_listener(addr: &str) -> std::io::Result<std::net::TcpListener> {
    let sock_addr: SocketAddr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "address not found"))?;
    let socket = Socket::new(
        Domain::for_address(sock_addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&sock_addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl HttpServer {
    /// Whether this listener terminates TLS.
    pub fn is_tls(&self) -> bool {
        self.tls_config.is_some()
    }

    /// Accepts connections until [`stop`](Self::stop). Returns once the
    /// listener has shut down.
    pub async fn serve(self: Arc<Self>) -> Result<(), ServeError> {
        let listener = bind_listener(&self.addr)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        self.serve_on(listener).await
    }

    /// Like [`serve`](Self::serve) on an already-bound listener, so callers
    /// can hand in an ephemeral port.
    pub async fn serve_on(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
    ) -> Result<(), ServeError> {
        log::info!(
            "Serving {} on {}",
            if self.is_tls() { "HTTPS" } else { "HTTP" },
            listener.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| self.addr.clone())
        );

        if let Some(ticketer) = self.ticketer.clone() {
            let mut closing = self.closing.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tls::TICKET_ROTATION_INTERVAL);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => ticketer.rotate(),
                        _ = closing.changed() => break,
                    }
                }
            });
        }

        let mut closing = self.closing.subscribe();
        loop {
            tokio::select! {
                _ = closing.changed() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed on {}: {}", self.addr, e);
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        CONNECTIONS.add();
                        telemetry!(telemetry::ACTIVE_CONNECTIONS.inc());
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            log::debug!("Connection {} ended: {}", peer, e);
                        }
                        mitm::forget(&peer);
                        telemetry!(telemetry::ACTIVE_CONNECTIONS.dec());
                        CONNECTIONS.done();
                    });
                }
            }
        }
        Ok(())
    }

    /// Stops accepting, then waits up to `timeout` for in-flight
    /// connections to drain.
    pub async fn stop(&self, timeout: Duration) {
        let _ = self.closing.send(true);
        CONNECTIONS.wait_idle(timeout).await;
    }

    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), ServeError> {
        stream.set_nodelay(true).ok();
        let secure = self.tls_config.is_some();

        let boxed: BoxedStream = match &self.tls_config {
            Some(config) => {
                let mut stream = stream;
                let handshake = async {
                    let (consumed, hello) = mitm::capture(&mut stream).await?;
                    telemetry!(telemetry::TLS_HANDSHAKES.inc());
                    mitm::remember(peer, hello);
                    let acceptor = tokio_rustls::TlsAcceptor::from(config.clone());
                    acceptor.accept(PrefixedStream::new(consumed, stream)).await
                };
                let tls_stream = match self.timeouts.read_header {
                    Some(limit) => tokio::time::timeout(limit, handshake)
                        .await
                        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??,
                    None => handshake.await?,
                };
                Box::new(tls_stream)
            }
            None => Box::new(stream),
        };

        let (read_half, write_half) = tokio::io::split(boxed);
        let mut reader = Some(BufReader::new(read_half));
        let mut writer = Some(write_half);
        let mut first = true;

        loop {
            let wait = if first {
                self.timeouts.read_header.or(self.timeouts.read)
            } else {
                self.timeouts.idle.or(self.timeouts.read_header)
            };
            first = false;

            let conn_reader = reader.as_mut().ok_or(crate::error::CapabilityError::Hijack)?;
            let read = request::read_request(conn_reader, peer, secure, self.limits);
            let parsed = match wait {
                Some(limit) => match tokio::time::timeout(limit, read).await {
                    Ok(parsed) => parsed,
                    Err(_) => break,
                },
                None => read.await,
            };

            let mut req = match parsed {
                Ok(Some(req)) => req,
                Ok(None) => break,
                Err(e) => {
                    let status = match &e {
                        ServeError::MaxBodyExceeded(_) => 413,
                        ServeError::Protocol(_) => 400,
                        _ => break,
                    };
                    let mut rec = ResponseRecorder::new(
                        writer.take().ok_or(crate::error::CapabilityError::Flush)?,
                        reader.take().ok_or(crate::error::CapabilityError::Hijack)?,
                        false,
                        false,
                        false,
                        None,
                    );
                    middleware::write_default_body(&mut rec, status).await?;
                    rec.finish().await?;
                    break;
                }
            };

            let shutting_down = *self.closing.subscribe().borrow();
            let keep_alive = req.wants_keep_alive() && !shutting_down;
            let http10 = req.proto == "HTTP/1.0";
            let head_only = matches!(req.method, crate::request::Method::Head);

            let close_notify = {
                let mut rx = self.closing.subscribe();
                rx.mark_unchanged();
                Some(rx)
            };
            let mut rec = ResponseRecorder::new(
                writer.take().ok_or(crate::error::CapabilityError::Flush)?,
                reader.take().ok_or(crate::error::CapabilityError::Hijack)?,
                http10,
                head_only,
                keep_alive,
                close_notify,
            );

            let lookup_key = format!("{}{}", req.host(), req.url.path());
            let site = self
                .vhosts
                .lookup(&lookup_key)
                .map(|(site, _prefix)| site.clone());

            // Fingerprint verdict, recorded before any handler runs.
            if secure {
                if let Some(hello) = mitm::recall(&peer) {
                    let verdict = mitm::assess(&hello, &req.headers);
                    req.ctx.mitm = Some(verdict);
                    match verdict {
                        MitmVerdict::Likely => telemetry!(telemetry::MITM_LIKELY.inc()),
                        MitmVerdict::Unlikely => telemetry!(telemetry::MITM_UNLIKELY.inc()),
                        MitmVerdict::Unknown => telemetry!(telemetry::MITM_UNKNOWN.inc()),
                    }
                    if verdict == MitmVerdict::Likely
                        && site.as_ref().map_or(false, |s| s.close_on_mitm)
                    {
                        log::info!("Closing connection from {}: interception detected", peer);
                        break;
                    }
                }
            }

            telemetry!(telemetry::REQUESTS_TOTAL.inc());
            let dispatch = async {
                let status = match &site {
                    Some(site) => {
                        let outcome = AssertUnwindSafe(site.handler.serve(&mut rec, &mut req))
                            .catch_unwind()
                            .await;
                        match outcome {
                            Ok(Ok(status)) => status,
                            Ok(Err(e)) => {
                                log::error!("[ERROR {}] {}", req.url.path(), e);
                                500
                            }
                            Err(_) => {
                                telemetry!(telemetry::PANICS_RECOVERED.inc());
                                log::error!("[PANIC {}] handler panicked", req.url.path());
                                500
                            }
                        }
                    }
                    None => 404,
                };

                if status >= 400 && !rec.wrote_header() && !rec.is_hijacked() {
                    middleware::write_default_body(&mut rec, status).await?;
                }
                rec.finish().await?;
                Ok::<(), ServeError>(())
            };
            match self.timeouts.write {
                Some(limit) => match tokio::time::timeout(limit, dispatch).await {
                    Ok(done) => done?,
                    Err(_) => break,
                },
                None => dispatch.await?,
            }

            match rec.status() {
                400..=499 => telemetry!(telemetry::RESPONSES_4XX.inc()),
                500..=599 => telemetry!(telemetry::RESPONSES_5XX.inc()),
                _ => {}
            }
            telemetry!(telemetry::BYTES_WRITTEN.inc_by(rec.size()));

            if rec.is_hijacked() {
                // The handler owns the socket now; our entry dies with it.
                mitm::forget(&peer);
                return Ok(());
            }
            let keep = rec.keep_alive();
            match rec.into_conn() {
                Some((r, w)) => {
                    reader = Some(r);
                    writer = Some(w);
                }
                None => break,
            }
            if !keep {
                break;
            }
        }
        Ok(())
    }
}
