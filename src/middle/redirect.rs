//! External redirects with placeholder expansion and `if` gating.

use crate::matcher::RequestMatcher;
use crate::middleware::{Handler, HandlerRef, Middleware, ServeResult};
use crate::pathmatch;
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RedirRule {
    pub from: String,
    pub to: String,
    pub code: u16,
    pub matcher: RequestMatcher,
}

pub struct Redirect {
    next: HandlerRef,
    rules: Vec<RedirRule>,
    case_sensitive: bool,
}

pub fn middleware(rules: Vec<RedirRule>, case_sensitive: bool) -> Middleware {
    Box::new(move |next| {
        Arc::new(Redirect {
            next,
            rules,
            case_sensitive,
        })
    })
}

#[async_trait]
impl Handler for Redirect {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        for rule in &self.rules {
            if !pathmatch::matches(r.url.path(), &rule.from, self.case_sensitive) {
                continue;
            }
            if !rule.matcher.matches(r) {
                continue;
            }
            let location = r.ctx.replacer.replace(&rule.to, r, None);
            w.headers_mut().set("Location", location);
            w.write_header(rule.code).await?;
            return Ok(0);
        }
        self.next.serve(w, r).await
    }
}
