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

//! # HTTP Basic Authentication
//!
//! Protects resource path prefixes. Password verifiers compare SHA-256
//! digests in constant time; htpasswd files are parsed once per process
//! and cached behind a mutex.

use crate::middleware::{Handler, HandlerRef, Middleware, ServeResult};
use crate::pathmatch;
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;

pub const DEFAULT_REALM: &str = "Restricted";

/// How a rule checks a password.
pub enum Verifier {
    /// SHA-256 digest of the configured password.
    Digest([u8; 32]),
    /// Lookup in an htpasswd-style file, lazily parsed and cached.
    Htpasswd(PathBuf),
}

pub struct Rule {
    pub username: String,
    pub verifier: Verifier,
    pub resources: Vec<String>,
    pub realm: String,
}

impl Rule {
    pub fn with_password(username: String, password: &str, resources: Vec<String>, realm: Option<String>) -> Self {
        let digest: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        Self {
            username,
            verifier: Verifier::Digest(digest),
            resources,
            realm: realm.unwrap_or_else(|| DEFAULT_REALM.to_string()),
        }
    }

    pub fn with_htpasswd(username: String, file: PathBuf, resources: Vec<String>, realm: Option<String>) -> Self {
        Self {
            username,
            verifier: Verifier::Htpasswd(file),
            resources,
            realm: realm.unwrap_or_else(|| DEFAULT_REALM.to_string()),
        }
    }

    fn verify(&self, username: &str, password: &str) -> bool {
        if self.username != username {
            return false;
        }
        match &self.verifier {
            Verifier::Digest(expected) => constant_time_password_eq(expected, password),
            Verifier::Htpasswd(path) => htpasswd_verify(path, username, password),
        }
    }
}

fn constant_time_password_eq(expected: &[u8; 32], password: &str) -> bool {
    let candidate: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    expected.ct_eq(&candidate).into()
}

lazy_static::lazy_static! {
    /// Parsed htpasswd files, keyed by path; populated on first reference.
    static ref HTPASSWD_CACHE: Mutex<HashMap<PathBuf, HashMap<String, String>>> =
        Mutex::new(HashMap::new());
}

/// Verifies against a cached htpasswd file. Supported entry forms are
/// `{SHA256}<base64>` and plaintext; other schemes are skipped with a
/// warning at load.
fn htpasswd_verify(path: &PathBuf, username: &str, password: &str) -> bool {
    let mut cache = match HTPASSWD_CACHE.lock() {
        Ok(cache) => cache,
        Err(_) => return false,
    };
    if !cache.contains_key(path) {
        let mut entries = HashMap::new();
        if let Ok(contents) = std::fs::read_to_string(path) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((user, encoded)) = line.split_once(':') {
                    if encoded.starts_with("{SHA}") || encoded.starts_with("$") {
                        log::warn!(
                            "htpasswd {}: unsupported scheme for user '{}' (use {{SHA256}} or plaintext)",
                            path.display(),
                            user
                        );
                        continue;
                    }
                    entries.insert(user.to_string(), encoded.to_string());
                }
            }
        } else {
            log::warn!("Cannot read htpasswd file {}", path.display());
        }
        cache.insert(path.clone(), entries);
    }

    let encoded = match cache.get(path).and_then(|entries| entries.get(username)) {
        Some(encoded) => encoded,
        None => return false,
    };
    if let Some(b64) = encoded.strip_prefix("{SHA256}") {
        let expected = match base64::engine::general_purpose::STANDARD.decode(b64) {
            Ok(expected) => expected,
            Err(_) => return false,
        };
        let candidate: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        return expected.ct_eq(&candidate).into();
    }
    encoded.as_bytes().ct_eq(password.as_bytes()).into()
}

pub struct BasicAuth {
    next: HandlerRef,
    rules: Vec<Rule>,
    case_sensitive: bool,
}

pub fn middleware(rules: Vec<Rule>, case_sensitive: bool) -> Middleware {
    Box::new(move |next| {
        Arc::new(BasicAuth {
            next,
            rules,
            case_sensitive,
        })
    })
}

/// Credentials from an `Authorization: Basic` header.
fn credentials(r: &Request) -> Option<(String, String)> {
    let header = r.headers.get("Authorization")?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[async_trait]
impl Handler for BasicAuth {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        let path = r.url.path().to_string();
        let mut realm = None;
        let mut protected = false;

        for rule in &self.rules {
            let applies = rule
                .resources
                .iter()
                .any(|res| pathmatch::matches(&path, res, self.case_sensitive));
            if !applies {
                continue;
            }
            protected = true;
            realm.get_or_insert(rule.realm.clone());

            if let Some((user, pass)) = credentials(r) {
                if rule.verify(&user, &pass) {
                    r.ctx.remote_user = Some(user);
                    return self.next.serve(w, r).await;
                }
            }
        }

        if !protected {
            return self.next.serve(w, r).await;
        }
        let realm = realm.unwrap_or_else(|| DEFAULT_REALM.to_string());
        w.headers_mut()
            .set("WWW-Authenticate", format!("Basic realm=\"{}\"", realm));
        Ok(401)
    }
}
