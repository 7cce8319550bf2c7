//! Internal URL rewriting. Rules are gated by base path, extension
//! filters, an optional regex over the path, and the shared `if` matcher;
//! the first matching rule rewrites the live URL and the chain continues.

use crate::matcher::RequestMatcher;
use crate::middleware::{Handler, HandlerRef, Middleware, ServeResult};
use crate::pathmatch;
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;

pub struct RewriteRule {
    pub base: String,
    /// Extension filters; `/` stands for extension-less paths.
    pub exts: Vec<String>,
    pub pattern: Option<Regex>,
    pub matcher: RequestMatcher,
    /// Candidate targets; all but the last require the file to exist.
    pub to: Vec<String>,
}

pub struct Rewrite {
    next: HandlerRef,
    rules: Vec<RewriteRule>,
    root: PathBuf,
    case_sensitive: bool,
}

pub fn middleware(rules: Vec<RewriteRule>, root: PathBuf, case_sensitive: bool) -> Middleware {
    Box::new(move |next| {
        Arc::new(Rewrite {
            next,
            rules,
            root,
            case_sensitive,
        })
    })
}

fn ext_matches(exts: &[String], path: &str) -> bool {
    if exts.is_empty() {
        return true;
    }
    let last_seg = path.rsplit('/').next().unwrap_or("");
    exts.iter().any(|ext| {
        if ext == "/" {
            !last_seg.contains('.')
        } else {
            path.ends_with(ext.as_str())
        }
    })
}

impl Rewrite {
    /// Picks the first target whose file exists under the root; the last
    /// candidate needs no such proof.
    async fn resolve_target(&self, rule: &RewriteRule, r: &Request) -> Option<String> {
        for (i, to) in rule.to.iter().enumerate() {
            let expanded = r.ctx.replacer.replace(to, r, None);
            if i + 1 == rule.to.len() {
                return Some(expanded);
            }
            let path_part = expanded.split('?').next().unwrap_or("");
            let candidate = self.root.join(path_part.trim_start_matches('/'));
            if tokio::fs::metadata(&candidate).await.is_ok() {
                return Some(expanded);
            }
        }
        None
    }
}

#[async_trait]
impl Handler for Rewrite {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        for rule in &self.rules {
            let path = r.url.path().to_string();
            if !pathmatch::matches(&path, &rule.base, self.case_sensitive) {
                continue;
            }
            if !ext_matches(&rule.exts, &path) {
                continue;
            }
            if let Some(pattern) = &rule.pattern {
                if !pattern.is_match(&path) {
                    continue;
                }
            }
            if !rule.matcher.matches(r) {
                continue;
            }
            if let Some(target) = self.resolve_target(rule, r).await {
                apply_rewrite(r, &target);
                break;
            }
        }
        self.next.serve(w, r).await
    }
}

/// Mutates the live URL only; the original URL in the context is untouched,
/// so `{path}`-family placeholders keep their pre-rewrite meaning.
fn apply_rewrite(r: &mut Request, target: &str) {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    r.url.set_path(&path);
    r.url.set_query(query);
}
