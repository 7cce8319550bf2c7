//! Request logging through the replacer. The default formats are the
//! classic access-log shapes; any placeholder template works.

use crate::middleware::{Handler, HandlerRef, Middleware, ServeResult};
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub const COMMON_LOG_FORMAT: &str =
    "{remote} - {user} [{when}] \"{method} {uri} {proto}\" {status} {size}";
pub const COMBINED_LOG_FORMAT: &str =
    "{remote} - {user} [{when}] \"{method} {uri} {proto}\" {status} {size} \"{>Referer}\" \"{>User-Agent}\"";
pub const COMMON_LOG_EMPTY_VALUE: &str = "-";

enum Output {
    /// Through the `log` facade under the `http.access` target.
    Facade,
    File(Mutex<std::fs::File>),
}

pub struct Logger {
    next: HandlerRef,
    format: String,
    output: Output,
}

pub fn middleware(format: Option<String>, file: Option<PathBuf>) -> std::io::Result<Middleware> {
    let format = match format.as_deref() {
        None | Some("common") | Some("{common}") => COMMON_LOG_FORMAT.to_string(),
        Some("combined") | Some("{combined}") => COMBINED_LOG_FORMAT.to_string(),
        Some(custom) => custom.to_string(),
    };
    let output = match file {
        Some(path) => Output::File(Mutex::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => Output::Facade,
    };
    Ok(Box::new(move |next| {
        Arc::new(Logger {
            next,
            format,
            output,
        })
    }))
}

#[async_trait]
impl Handler for Logger {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        let result = self.next.serve(w, r).await;

        // A status the chain returned but nobody wrote yet will become the
        // response status once the default responder runs; log that one.
        let pending = match &result {
            Ok(status) if *status >= 400 && !w.wrote_header() => Some(*status),
            Err(_) if !w.wrote_header() => Some(500),
            _ => None,
        };
        let mut rep = r.ctx.replacer.clone();
        if let Some(status) = pending {
            rep.set("status", status.to_string());
        }
        let line = rep.replace_with(&self.format, r, Some(&*w), COMMON_LOG_EMPTY_VALUE);

        match &self.output {
            Output::Facade => log::info!(target: "http.access", "{}", line),
            Output::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = writeln!(file, "{}", line);
                }
            }
        }
        result
    }
}
