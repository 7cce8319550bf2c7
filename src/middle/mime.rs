//! Content-Type overrides by file extension.

use crate::middleware::{Handler, HandlerRef, Middleware, ServeResult};
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Mime {
    next: HandlerRef,
    /// Extension (with leading dot) to content type.
    types: HashMap<String, String>,
}

pub fn middleware(types: HashMap<String, String>) -> Middleware {
    Box::new(move |next| Arc::new(Mime { next, types }))
}

#[async_trait]
impl Handler for Mime {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        let path = r.url.path();
        if let Some(idx) = path.rfind('.') {
            if let Some(mime) = self.types.get(&path[idx..]) {
                w.headers_mut().set("Content-Type", mime.clone());
            }
        }
        self.next.serve(w, r).await
    }
}
