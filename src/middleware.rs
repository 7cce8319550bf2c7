//! # Handler and Middleware Contract
//!
//! A handler serves a request and returns a status code:
//!
//! - `0` means the handler (or something downstream) fully wrote the
//!   response; nothing upstream may write again.
//! - `>= 400` means the response has *not* been written; the server entry
//!   point renders the default plain-text body unless an error handler
//!   upstream already did.
//!
//! The accompanying error is carried for logging only; it never reaches the
//! client. A middleware is a function from the next handler to a new
//! handler; site chains are folded right-to-left once at server build.

use crate::error::ServeError;
use crate::pathmatch;
use crate::recorder::ResponseRecorder;
use crate::request::Request;
use async_trait::async_trait;
use std::sync::Arc;

/// Outcome of a handler: the status contract described in the module docs.
pub type ServeResult = Result<u16, ServeError>;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult;
}

/// A compiled, shareable handler.
pub type HandlerRef = Arc<dyn Handler>;

/// A middleware: wraps the next handler, yielding a new one.
pub type Middleware = Box<dyn FnOnce(HandlerRef) -> HandlerRef + Send>;

/// Folds middlewares right-to-left over the terminal handler, producing the
/// site's immutable compiled chain. No per-request allocation happens after
/// this point.
pub fn compile(middlewares: Vec<Middleware>, terminal: HandlerRef) -> HandlerRef {
    let mut handler = terminal;
    for mw in middlewares.into_iter().rev() {
        handler = mw(handler);
    }
    handler
}

/// The fixed order in which site directives are compiled into the chain,
/// regardless of their order in the config file. `root`, `bind` and `tls`
/// configure the site rather than contributing a handler but participate in
/// ordering for completeness.
pub const DIRECTIVE_ORDER: &[&str] = &[
    "root",
    "bind",
    "tls",
    "log",
    "gzip",
    "errors",
    "header",
    "rewrite",
    "redir",
    "ext",
    "mime",
    "basicauth",
    "internal",
    "proxy",
];

/// Picks the most specific of a handler's per-path configs: the one with
/// the longest base path that matches the request path.
pub fn select_config<'a, C>(
    configs: &'a [(String, C)],
    path: &str,
    case_sensitive: bool,
) -> Option<&'a C> {
    let mut best: Option<(&'a str, &'a C)> = None;
    for (base, cfg) in configs {
        if pathmatch::matches(path, base, case_sensitive)
            && best.map_or(true, |(b, _)| base.len() > b.len())
        {
            best = Some((base.as_str(), cfg));
        }
    }
    best.map(|(_, cfg)| cfg)
}

/// Reason phrase for a status code.
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        421 => "Misdirected Request",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

/// Writes the default plain-text error body: `<N> <text>\n`.
///
/// Used by the entry point for any `status >= 400` return whose response
/// was not written by a handler.
pub async fn write_default_body(
    w: &mut ResponseRecorder,
    status: u16,
) -> Result<(), ServeError> {
    let body = format!("{} {}\n", status, status_text(status));
    w.headers_mut()
        .set("Content-Type", "text/plain; charset=utf-8");
    w.headers_mut().set("X-Content-Type-Options", "nosniff");
    w.headers_mut().set("Content-Length", body.len().to_string());
    w.write_header(status).await?;
    w.write_body(body.as_bytes()).await?;
    Ok(())
}
