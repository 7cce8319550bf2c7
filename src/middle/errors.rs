//! Error-page handler: turns unwritten `status >= 400` returns into
//! custom pages and records handler errors to the error log.

use crate::error::ServeError;
use crate::middleware::{status_text, Handler, HandlerRef, Middleware, ServeResult};
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub struct Errors {
    next: HandlerRef,
    pages: HashMap<u16, PathBuf>,
    log_file: Option<Mutex<std::fs::File>>,
}

pub fn middleware(
    pages: HashMap<u16, PathBuf>,
    log_path: Option<PathBuf>,
) -> std::io::Result<Middleware> {
    let log_file = match log_path {
        Some(path) => Some(Mutex::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => None,
    };
    Ok(Box::new(move |next| {
        Arc::new(Errors {
            next,
            pages,
            log_file,
        })
    }))
}

impl Errors {
    fn log_error(&self, line: &str) {
        match &self.log_file {
            Some(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{}", line);
                }
            }
            None => log::error!(target: "http.errors", "{}", line),
        }
    }

    async fn render_page(
        &self,
        w: &mut ResponseRecorder,
        status: u16,
    ) -> Result<bool, ServeError> {
        let page = match self.pages.get(&status) {
            Some(page) => page,
            None => return Ok(false),
        };
        let body = match tokio::fs::read(page).await {
            Ok(body) => body,
            Err(e) => {
                self.log_error(&format!(
                    "cannot open error page {}: {}",
                    page.display(),
                    e
                ));
                return Ok(false);
            }
        };
        w.headers_mut().set("Content-Type", "text/html; charset=utf-8");
        w.headers_mut().set("Content-Length", body.len().to_string());
        w.write_header(status).await?;
        w.write_body(&body).await?;
        Ok(true)
    }
}

#[async_trait]
impl Handler for Errors {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        match self.next.serve(w, r).await {
            Ok(status) if status >= 400 && !w.wrote_header() && !w.is_hijacked() => {
                if self.render_page(w, status).await? {
                    Ok(0)
                } else {
                    Ok(status)
                }
            }
            Err(e) => {
                self.log_error(&format!(
                    "[ERROR 500 {}] {}: {}",
                    r.url.path(),
                    status_text(500),
                    e
                ));
                if !w.wrote_header() && self.render_page(w, 500).await? {
                    Ok(0)
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }
}
