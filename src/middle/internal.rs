//! Internal-only locations. Requests hitting an internal path from the
//! edge get a 404; inner handlers can hand back an `X-Accel-Redirect`
//! (header set, response unwritten) to restart dispatch on a new path.

use crate::middleware::{Handler, HandlerRef, Middleware, ServeResult};
use crate::pathmatch;
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use std::sync::Arc;

const MAX_REDIRECTS: usize = 10;

pub struct Internal {
    next: HandlerRef,
    paths: Vec<String>,
    case_sensitive: bool,
}

pub fn middleware(paths: Vec<String>, case_sensitive: bool) -> Middleware {
    Box::new(move |next| {
        Arc::new(Internal {
            next,
            paths,
            case_sensitive,
        })
    })
}

impl Internal {
    fn is_internal(&self, path: &str) -> bool {
        self.paths
            .iter()
            .any(|p| pathmatch::matches(path, p, self.case_sensitive))
    }
}

#[async_trait]
impl Handler for Internal {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        if self.is_internal(r.url.path()) {
            return Ok(404);
        }

        let mut status = self.next.serve(w, r).await?;
        let mut redirects = 0;
        while redirects < MAX_REDIRECTS && !w.wrote_header() {
            let target = match w.headers().get("X-Accel-Redirect") {
                Some(target) => target.to_string(),
                None => break,
            };
            w.headers_mut().remove("X-Accel-Redirect");
            let (path, query) = match target.split_once('?') {
                Some((path, query)) => (path, Some(query)),
                None => (target.as_str(), None),
            };
            r.url.set_path(path);
            r.url.set_query(query);
            status = self.next.serve(w, r).await?;
            redirects += 1;
        }
        Ok(status)
    }
}
