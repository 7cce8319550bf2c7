//! Response compression. Eligibility is decided from the request
//! (`Accept-Encoding`, extension and path filters); the recorder carries
//! the actual encoder so the whole downstream chain is compressed.

use crate::middleware::{Handler, HandlerRef, Middleware, ServeResult};
use crate::pathmatch;
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use std::sync::Arc;

pub const DEFAULT_LEVEL: u32 = 6;

pub struct Gzip {
    next: HandlerRef,
    extensions: Vec<String>,
    paths: Vec<String>,
    level: u32,
    case_sensitive: bool,
}

pub fn middleware(
    extensions: Vec<String>,
    paths: Vec<String>,
    level: Option<u32>,
    case_sensitive: bool,
) -> Middleware {
    Box::new(move |next| {
        Arc::new(Gzip {
            next,
            extensions,
            paths,
            level: level.unwrap_or(DEFAULT_LEVEL).min(9),
            case_sensitive,
        })
    })
}

impl Gzip {
    fn eligible(&self, path: &str) -> bool {
        if !self.paths.is_empty()
            && !self
                .paths
                .iter()
                .any(|p| pathmatch::matches(path, p, self.case_sensitive))
        {
            return false;
        }
        if !self.extensions.is_empty() {
            let last_seg = path.rsplit('/').next().unwrap_or("");
            return self.extensions.iter().any(|ext| {
                if ext == "/" {
                    !last_seg.contains('.')
                } else {
                    path.ends_with(ext.as_str())
                }
            });
        }
        true
    }
}

#[async_trait]
impl Handler for Gzip {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        let accepts = r
            .headers
            .get("Accept-Encoding")
            .map(|v| v.contains("gzip"))
            .unwrap_or(false);
        if !accepts || !self.eligible(r.url.path()) {
            return self.next.serve(w, r).await;
        }

        // Inner handlers (notably the proxy) must not negotiate their own
        // compression on top of ours.
        r.headers.remove("Accept-Encoding");
        w.enable_gzip(self.level);
        self.next.serve(w, r).await
    }
}
