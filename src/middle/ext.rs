//! Clean-URL extension resolution: `/about` becomes `/about.html` when
//! that file exists under the site root.

use crate::middleware::{Handler, HandlerRef, Middleware, ServeResult};
use crate::recorder::ResponseRecorder;
use crate::replacer::percent_decode;
use crate::request::Request;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Ext {
    next: HandlerRef,
    extensions: Vec<String>,
    root: PathBuf,
}

pub fn middleware(extensions: Vec<String>, root: PathBuf) -> Middleware {
    Box::new(move |next| {
        Arc::new(Ext {
            next,
            extensions,
            root,
        })
    })
}

#[async_trait]
impl Handler for Ext {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        let path = r.url.path().to_string();
        let last_seg = path.rsplit('/').next().unwrap_or("");
        if !path.ends_with('/') && !last_seg.contains('.') {
            for ext in &self.extensions {
                let candidate = format!("{}{}", path, ext);
                let fs_path = self
                    .root
                    .join(percent_decode(&candidate).trim_start_matches('/'));
                let is_file = tokio::fs::metadata(&fs_path)
                    .await
                    .map(|m| m.is_file())
                    .unwrap_or(false);
                if is_file {
                    r.url.set_path(&candidate);
                    break;
                }
            }
        }
        self.next.serve(w, r).await
    }
}
