//! Per-site configuration and the listener-group timeout merge.

use crate::address::Address;
use crate::middleware::Middleware;
use std::path::PathBuf;
use std::time::Duration;

/// Group-level defaults applied when no site in the group sets a value.
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-site timeouts. `None` means unset (fall back to the default);
/// `Some(Duration::ZERO)` means explicitly disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Option<Duration>,
    pub read_header: Option<Duration>,
    pub write: Option<Duration>,
    pub idle: Option<Duration>,
}

/// Timeouts effective for one listener, after merging its sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveTimeouts {
    pub read: Option<Duration>,
    pub read_header: Option<Duration>,
    pub write: Option<Duration>,
    pub idle: Option<Duration>,
}

/// Merges the timeouts of all sites sharing a listener. The strictest
/// (minimum positive) explicit value wins per field; a field nobody sets
/// falls back to the default; all-zero means disabled.
pub fn merge_timeouts<'a>(timeouts: impl Iterator<Item = &'a Timeouts> + Clone) -> EffectiveTimeouts {
    EffectiveTimeouts {
        read: merge_field(timeouts.clone().map(|t| t.read), None),
        read_header: merge_field(
            timeouts.clone().map(|t| t.read_header),
            Some(DEFAULT_READ_HEADER_TIMEOUT),
        ),
        write: merge_field(timeouts.clone().map(|t| t.write), None),
        idle: merge_field(timeouts.map(|t| t.idle), Some(DEFAULT_IDLE_TIMEOUT)),
    }
}

fn merge_field(
    values: impl Iterator<Item = Option<Duration>>,
    default: Option<Duration>,
) -> Option<Duration> {
    let mut any_set = false;
    let mut min_positive: Option<Duration> = None;
    for value in values.flatten() {
        any_set = true;
        if value > Duration::ZERO {
            min_positive = Some(match min_positive {
                Some(current) => current.min(value),
                None => value,
            });
        }
    }
    if any_set {
        min_positive.or(Some(Duration::ZERO)).filter(|d| *d > Duration::ZERO)
    } else {
        default
    }
}

/// Merges per-site byte caps (header or body): the smallest positive one
/// wins.
pub fn merge_size_cap(values: impl Iterator<Item = Option<usize>>) -> Option<usize> {
    values.flatten().filter(|v| *v > 0).min()
}

/// TLS settings for one site.
#[derive(Debug, Clone, Default)]
pub struct TlsSiteConfig {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Generate an in-memory certificate at build instead of loading PEMs.
    pub self_signed: bool,
}

/// Everything the server builder needs to know about one site.
///
/// The parsing context owns these exclusively; the server builder consumes
/// the middleware factories when it folds the site's chain, which is
/// immutable from then on.
pub struct SiteConfig {
    pub addr: Address,
    /// Listen-host override (`bind`); empty means the address host decides.
    pub listen_host: String,
    pub tls: Option<TlsSiteConfig>,
    pub root: PathBuf,
    pub hidden: Vec<String>,
    pub timeouts: Timeouts,
    pub max_header_bytes: Option<usize>,
    pub max_body_bytes: Option<usize>,
    /// Uncompiled middleware factories, already in directive order.
    pub middleware: Vec<Middleware>,
    /// Close connections the classifier flags as intercepted.
    pub close_on_mitm: bool,
}

impl std::fmt::Debug for SiteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteConfig")
            .field("addr", &self.addr)
            .field("listen_host", &self.listen_host)
            .field("root", &self.root)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}
