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

//! # Reverse Proxy
//!
//! Forwards matched requests to a set of upstreams, round-robin, copying
//! method, headers and body both ways. Hop-by-hop headers stay on their
//! hop; `X-Forwarded-For` and `X-Forwarded-Proto` tell the upstream who
//! really called. Upstream failure surfaces as 502.

use crate::middleware::{Handler, HandlerRef, Middleware, ServeResult};
use crate::pathmatch;
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const HOP_BY_HOP: [&str; 8] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Te",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

pub struct ProxyRule {
    pub base: String,
    pub upstreams: Vec<Url>,
    next_upstream: AtomicUsize,
}

impl ProxyRule {
    pub fn new(base: String, upstreams: Vec<Url>) -> Self {
        Self {
            base,
            upstreams,
            next_upstream: AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> &Url {
        let idx = self.next_upstream.fetch_add(1, Ordering::Relaxed);
        &self.upstreams[idx % self.upstreams.len()]
    }
}

pub struct Proxy {
    next: HandlerRef,
    rules: Vec<ProxyRule>,
    client: reqwest::Client,
    case_sensitive: bool,
}

pub fn middleware(rules: Vec<ProxyRule>, case_sensitive: bool) -> Middleware {
    Box::new(move |next| {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Arc::new(Proxy {
            next,
            rules,
            client,
            case_sensitive,
        })
    })
}

impl Proxy {
    /// The matching rule with the longest base path.
    fn select_rule(&self, path: &str) -> Option<&ProxyRule> {
        let mut best: Option<&ProxyRule> = None;
        for rule in &self.rules {
            if pathmatch::matches(path, &rule.base, self.case_sensitive)
                && best.map_or(true, |b| rule.base.len() > b.base.len())
            {
                best = Some(rule);
            }
        }
        best
    }
}

#[async_trait]
impl Handler for Proxy {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        let rule = match self.select_rule(r.url.path()) {
            Some(rule) => rule,
            None => return self.next.serve(w, r).await,
        };
        let upstream = rule.pick();

        let mut target = upstream.clone();
        target.set_path(&join_paths(upstream.path(), r.url.path()));
        target.set_query(r.url.query());

        let method = reqwest::Method::from_bytes(r.method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut outbound = self.client.request(method, target.clone());
        for (name, value) in r.headers.iter() {
            if name.eq_ignore_ascii_case("Host")
                || HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
            {
                continue;
            }
            outbound = outbound.header(name, value);
        }
        let forwarded_for = match r.headers.get("X-Forwarded-For") {
            Some(prior) => format!("{}, {}", prior, r.remote_addr.ip()),
            None => r.remote_addr.ip().to_string(),
        };
        outbound = outbound
            .header("X-Forwarded-For", forwarded_for)
            .header("X-Forwarded-Proto", r.ctx.original_url.scheme())
            .header("X-Forwarded-Host", r.host().to_string());
        if !r.body.is_empty() {
            outbound = outbound.body(r.body.clone());
        }

        let mut response = match outbound.send().await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Upstream {} unreachable: {}", target, e);
                return Ok(502);
            }
        };

        let status = response.status().as_u16();
        for (name, value) in response.headers() {
            if HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name.as_str())) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                w.headers_mut().add(name.as_str(), value);
            }
        }

        // An accel redirect is an instruction to this server, not a
        // response: leave it unwritten for the internal handler.
        if w.headers().contains("X-Accel-Redirect") {
            return Ok(0);
        }

        w.write_header(status).await?;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    w.write_body(&chunk).await?;
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Upstream {} aborted mid-body: {}", target, e);
                    w.set_keep_alive(false);
                    break;
                }
            }
        }
        Ok(0)
    }
}

/// Joins the upstream base path with the request path.
fn join_paths(base: &str, path: &str) -> String {
    if base.is_empty() || base == "/" {
        return path.to_string();
    }
    format!("{}{}", base.trim_end_matches('/'), path)
}
