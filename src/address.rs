//! Site address canonicalization.
//!
//! A site address is one or more tokens of the form
//! `[scheme://]host[:port][/path]`. Canonicalization resolves the
//! scheme/port relationship once so the rest of the server never has to
//! reason about `http` on port 443 or textual port names.

use crate::error::ServeError;

/// A canonicalized site identifier.
///
/// After [`standardize`] returns, `scheme` and `port` never contradict each
/// other: `http` implies a port other than 443 and `https` a port other
/// than 80, with empty ports filled in from the scheme.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    /// The input as given, used to derive the vhost key.
    pub original: String,
    /// `""`, `"http"` or `"https"`.
    pub scheme: String,
    pub host: String,
    pub port: String,
    pub path: String,
}

impl Address {
    /// The trie insertion key: the original input minus any `scheme://`
    /// prefix.
    pub fn vhost_key(&self) -> &str {
        match self.original.find("://") {
            Some(idx) => &self.original[idx + 3..],
            None => &self.original,
        }
    }
}

impl std::fmt::Display for Address {
    /// Reconstructs a human-friendly form, suppressing default ports.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.is_empty() && self.port.is_empty() {
            return Ok(());
        }
        let scheme = if self.scheme.is_empty() {
            if self.port == "443" {
                "https"
            } else {
                "http"
            }
        } else {
            &self.scheme
        };
        write!(f, "{}://{}", scheme, self.host)?;
        if !self.port.is_empty()
            && !(scheme == "https" && self.port == "443")
            && !(scheme == "http" && self.port == "80")
        {
            write!(f, ":{}", self.port)?;
        }
        f.write_str(&self.path)
    }
}

/// Parses and canonicalizes a free-form site address token.
pub fn standardize(input: &str) -> Result<Address, ServeError> {
    let invalid = |why: &str| ServeError::InvalidAddress(input.to_string(), why.to_string());

    let (mut scheme, rest) = match input.split_once("://") {
        Some((s, rest)) => match s {
            "" | "http" | "https" => (s.to_string(), rest),
            _ => return Err(invalid("unsupported scheme")),
        },
        None => (String::new(), input),
    };

    let (hostport, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };

    let (host, port) = split_host_port(hostport);
    let mut port = port.unwrap_or_default();

    // Derive the port from the scheme when it was left out.
    if port.is_empty() {
        match scheme.as_str() {
            "http" => port = "80".to_string(),
            "https" => port = "443".to_string(),
            _ => {}
        }
    }

    if !scheme.is_empty() && (port == "http" || port == "https") {
        return Err(invalid("scheme specified twice"));
    }
    if (scheme == "http" && port == "443") || (scheme == "https" && port == "80") {
        return Err(invalid("scheme and port violate convention"));
    }

    // Textual port names pin both the port number and the scheme.
    if port == "http" {
        scheme = "http".to_string();
        port = "80".to_string();
    } else if port == "https" {
        scheme = "https".to_string();
        port = "443".to_string();
    }

    Ok(Address {
        original: input.to_string(),
        scheme,
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

/// Splits `host[:port]`, leaving bracketed IPv6 literals intact.
pub(crate) fn split_host_port(s: &str) -> (&str, Option<String>) {
    if let Some(end) = s.rfind(']') {
        // "[::1]:8080" or bare "[::1]"
        return match s[end..].find(':') {
            Some(idx) => (&s[..end + 1], Some(s[end + idx + 1..].to_string())),
            None => (s, None),
        };
    }
    match s.rfind(':') {
        Some(idx) if s[..idx].contains(':') => (s, None), // unbracketed IPv6
        Some(idx) => (&s[..idx], Some(s[idx + 1..].to_string())),
        None => (s, None),
    }
}
