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

//! # Virtual-Host Trie
//!
//! Resolves an incoming `host/path` pair to one site. The trie has two
//! layers: the first maps whole hostnames (with `*` usable as any label,
//! certificate-style) to a second layer, a character trie over the path.
//! It is built once at server construction and is read-only while serving,
//! so lookups take no locks.

use crate::address::split_host_port;
use std::collections::HashMap;

/// Hosts tried, in order, when neither the exact host nor any wildcard
/// variant is present.
const FALLBACK_HOSTS: [&str; 3] = ["0.0.0.0", "[::]", ""];

/// Two-layer routing trie mapping `host[:port][/path]` keys to sites.
#[derive(Debug)]
pub struct VHostTrie<T> {
    hosts: HashMap<String, PathTrie<T>>,
}

impl<T> Default for VHostTrie<T> {
    fn default() -> Self {
        Self {
            hosts: HashMap::new(),
        }
    }
}

impl<T> VHostTrie<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a site under its vhost key. Insertion is total: any key is
    /// accepted, and an already-occupied terminal keeps its first site.
    pub fn insert(&mut self, key: &str, site: T) {
        let (host, path) = split_host_path(key);
        self.hosts
            .entry(host)
            .or_insert_with(PathTrie::new)
            .insert(&path, site);
    }

    /// Resolves `host/path` to the site with the longest matching path
    /// prefix under the best-matching host, or `None`.
    pub fn lookup(&self, key: &str) -> Option<(&T, &str)> {
        let (host, path) = split_host_path(key);
        let branch = self.match_host(&host).or_else(|| {
            FALLBACK_HOSTS
                .iter()
                .find_map(|fallback| self.hosts.get(*fallback))
        })?;
        branch.deepest(&path)
    }

    /// Exact host first, then wildcard variants with labels replaced by
    /// `*` from the left (`a.b.c` → `*.b.c` → `*.*.c` → `*.*.*`).
    fn match_host(&self, host: &str) -> Option<&PathTrie<T>> {
        if let Some(branch) = self.hosts.get(host) {
            return Some(branch);
        }
        let mut labels: Vec<&str> = host.split('.').collect();
        for i in 0..labels.len() {
            labels[i] = "*";
            let candidate = labels.join(".");
            if let Some(branch) = self.hosts.get(&candidate) {
                return Some(branch);
            }
        }
        None
    }
}

/// Splits a vhost key into (lower-cased host without port, rooted path).
fn split_host_path(key: &str) -> (String, String) {
    let (host, path) = match key.find('/') {
        Some(idx) => (&key[..idx], format!("/{}", &key[idx + 1..])),
        None => (key, "/".to_string()),
    };
    let (host, _) = split_host_port(host);
    (host.to_lowercase(), path)
}

/// Character trie over the path portion of a vhost key.
#[derive(Debug)]
struct PathTrie<T> {
    root: PathNode<T>,
}

#[derive(Debug)]
struct PathNode<T> {
    children: HashMap<u8, PathNode<T>>,
    /// Site and the path that was inserted, set on terminal nodes.
    site: Option<(T, String)>,
}

impl<T> PathNode<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            site: None,
        }
    }
}

impl<T> PathTrie<T> {
    fn new() -> Self {
        Self {
            root: PathNode::new(),
        }
    }

    fn insert(&mut self, path: &str, site: T) {
        let mut node = &mut self.root;
        for b in path.bytes() {
            node = node.children.entry(b).or_insert_with(PathNode::new);
        }
        // First insertion wins; config parsing order is deterministic.
        if node.site.is_none() {
            node.site = Some((site, path.to_string()));
        }
    }

    /// Deepest node along `path` that carries a site.
    fn deepest(&self, path: &str) -> Option<(&T, &str)> {
        let mut node = &self.root;
        let mut found = node.site.as_ref();
        for b in path.bytes() {
            match node.children.get(&b) {
                Some(child) => {
                    node = child;
                    if child.site.is_some() {
                        found = child.site.as_ref();
                    }
                }
                None => break,
            }
        }
        found.map(|(site, path)| (site, path.as_str()))
    }
}
