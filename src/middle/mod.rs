//! The compiled-in handler set. Each module contributes one directive;
//! the chain order is fixed by [`crate::middleware::DIRECTIVE_ORDER`].

pub mod basicauth;
pub mod errors;
pub mod ext;
pub mod gzip;
pub mod headers;
pub mod internal;
pub mod log;
pub mod mime;
pub mod proxy;
pub mod redirect;
pub mod rewrite;
pub mod staticfiles;
