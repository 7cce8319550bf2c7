//! Static response-header rules per path prefix, with placeholder
//! expansion. A removal applies to anything set earlier in the chain or by
//! the site defaults.

use crate::middleware::{Handler, HandlerRef, Middleware, ServeResult};
use crate::pathmatch;
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HeaderRule {
    pub path: String,
    pub add: Vec<(String, String)>,
    pub remove: Vec<String>,
}

pub struct Headers {
    next: HandlerRef,
    rules: Vec<HeaderRule>,
    case_sensitive: bool,
}

pub fn middleware(rules: Vec<HeaderRule>, case_sensitive: bool) -> Middleware {
    Box::new(move |next| {
        Arc::new(Headers {
            next,
            rules,
            case_sensitive,
        })
    })
}

#[async_trait]
impl Handler for Headers {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        for rule in &self.rules {
            if !pathmatch::matches(r.url.path(), &rule.path, self.case_sensitive) {
                continue;
            }
            for (name, value) in &rule.add {
                let value = r.ctx.replacer.replace(value, r, None);
                w.headers_mut().set(name, value);
            }
            for name in &rule.remove {
                w.headers_mut().remove(name);
            }
        }
        self.next.serve(w, r).await
    }
}
