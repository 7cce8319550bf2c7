//! URL path prefix matching and sanitization.

use rand::{distributions::Alphanumeric, Rng};

/// Reports whether the request path `p` falls under the base path `base`.
///
/// A base of `/` or `""` matches everything. Both sides are sanitized
/// (duplicate slashes collapsed, `.` and `..` segments resolved) with one
/// trailing slash preserved from each, then compared by prefix. Comparison
/// honors the process-wide case-sensitivity setting resolved into
/// `RuntimeConfig`; callers thread it in explicitly.
pub fn matches(p: &str, base: &str, case_sensitive: bool) -> bool {
    if base == "/" || base.is_empty() {
        return true;
    }
    let p = clean_preserving_slash(p);
    let base = clean_preserving_slash(base);
    if case_sensitive {
        p.starts_with(&base)
    } else {
        p.to_lowercase().starts_with(&base.to_lowercase())
    }
}

/// Lexically cleans `p`, keeping at most one trailing slash.
fn clean_preserving_slash(p: &str) -> String {
    let trailing = p.len() > 1 && p.ends_with('/');
    let mut out = clean(p);
    if trailing && !out.ends_with('/') {
        out.push('/');
    }
    out
}

/// Lexical path cleaning: collapses repeated slashes and resolves `.` and
/// `..` segments. Rooted paths never escape the root.
pub fn clean(p: &str) -> String {
    if p.is_empty() {
        return "/".to_string();
    }
    let rooted = p.starts_with('/');
    let mut segs: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if segs.last().map_or(false, |s| *s != "..") {
                    segs.pop();
                } else if !rooted {
                    segs.push("..");
                }
            }
            s => segs.push(s),
        }
    }
    let joined = segs.join("/");
    match (rooted, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", joined),
        (false, true) => "/".to_string(),
        (false, false) => joined,
    }
}

/// Cleans `p` while leaving the given substrings untouched.
///
/// Each mask occurrence is swapped for a random slash-free token before
/// cleaning and restored afterwards, so e.g. `://` inside a proxied URL
/// path survives slash collapsing.
pub fn clean_masked(p: &str, masks: &[&str]) -> String {
    let mut working = p.to_string();
    let mut subs: Vec<(String, String)> = Vec::new();
    for mask in masks {
        if working.contains(mask) {
            let token: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(24)
                .map(char::from)
                .collect();
            working = working.replace(mask, &token);
            subs.push((token, mask.to_string()));
        }
    }
    let mut cleaned = clean_preserving_slash(&working);
    for (token, mask) in subs {
        cleaned = cleaned.replace(&token, &mask);
    }
    cleaned
}

/// The standard request-path clean: masks `://` so proxied absolute URLs
/// keep their shape.
pub fn clean_request_path(p: &str) -> String {
    clean_masked(p, &["://"])
}
