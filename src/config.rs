//! Application configuration: the TOML file model, the process
//! `RuntimeConfig`, and the translation of parsed sites into
//! [`SiteConfig`] values with their middleware factories in directive
//! order.

use crate::address;
use crate::error::ServeError;
use crate::matcher::RequestMatcher;
use crate::middle;
use crate::middleware::Middleware;
use crate::site::{SiteConfig, Timeouts, TlsSiteConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The port sites listen on when neither the address nor the flags name
/// one.
pub const DEFAULT_PORT: &str = "2015";

/// Process-wide knobs, resolved once from flags and environment and
/// threaded through construction. Nothing here is a mutable global.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub default_host: String,
    pub default_port: String,
    pub default_root: PathBuf,
    pub case_sensitive_path: bool,
    /// How long `stop` waits for in-flight requests.
    pub grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_host: String::new(),
            default_port: DEFAULT_PORT.to_string(),
            default_root: PathBuf::from("."),
            case_sensitive_path: case_sensitive_from_env(),
            grace: Duration::from_secs(5),
        }
    }
}

/// `CASE_SENSITIVE_PATH`: `1`/`true` enable, `0`/`false` disable;
/// matching is case-sensitive when unset.
fn case_sensitive_from_env() -> bool {
    match std::env::var("CASE_SENSITIVE_PATH") {
        Ok(value) => !matches!(value.as_str(), "0" | "false"),
        Err(_) => true,
    }
}

/// Root of the TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerToml,
    #[serde(rename = "site")]
    pub sites: Vec<SiteToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerToml {
    /// Grace period for shutdown, e.g. `"10s"`.
    pub grace: Option<String>,
    /// Address of the plain-text metrics exporter.
    pub metrics: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteToml {
    pub address: String,
    /// Listen-host override.
    pub bind: Option<String>,
    pub root: Option<PathBuf>,
    pub hide: Vec<String>,
    pub timeouts: Option<TimeoutsToml>,
    pub max_header_bytes: Option<usize>,
    pub max_request_body: Option<usize>,
    pub tls: Option<TlsToml>,
    pub log: Option<LogToml>,
    pub gzip: Option<GzipToml>,
    pub errors: Option<ErrorsToml>,
    pub header: Vec<HeaderToml>,
    pub rewrite: Vec<RewriteToml>,
    pub redir: Vec<RedirToml>,
    pub ext: Vec<String>,
    pub mime: HashMap<String, String>,
    pub basicauth: Vec<BasicAuthToml>,
    pub internal: Vec<String>,
    pub proxy: Vec<ProxyToml>,
    pub mitm: Option<MitmToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsToml {
    pub read: Option<String>,
    pub read_header: Option<String>,
    pub write: Option<String>,
    pub idle: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsToml {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub self_signed: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogToml {
    /// `common`, `combined`, or a placeholder template.
    pub format: Option<String>,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GzipToml {
    pub ext: Vec<String>,
    pub paths: Vec<String>,
    pub level: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorsToml {
    /// Status code (as table key) to page path.
    pub pages: HashMap<String, PathBuf>,
    pub log: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeaderToml {
    pub path: String,
    pub add: Vec<(String, String)>,
    pub remove: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RewriteToml {
    pub base: Option<String>,
    pub ext: Vec<String>,
    pub regexp: Option<String>,
    pub to: Vec<String>,
    #[serde(rename = "if")]
    pub conditions: Vec<[String; 3]>,
    pub if_op: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedirToml {
    pub from: Option<String>,
    pub to: String,
    pub code: Option<u16>,
    #[serde(rename = "if")]
    pub conditions: Vec<[String; 3]>,
    pub if_op: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BasicAuthToml {
    pub username: String,
    pub password: Option<String>,
    pub htpasswd: Option<PathBuf>,
    pub realm: Option<String>,
    pub resources: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyToml {
    pub path: Option<String>,
    pub upstreams: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MitmToml {
    pub close_on_detection: bool,
}

impl AppConfig {
    pub fn from_toml(s: &str) -> Result<Self, ServeError> {
        toml::from_str(s).map_err(|e| ServeError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ServeError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Sanity-checks every site before any listener is built.
    pub fn validate(&self) -> Result<(), ServeError> {
        for site in &self.sites {
            address::standardize(&site.address)?;
            for rule in &site.redir {
                let code = rule.code.unwrap_or(301);
                if !(300..400).contains(&code) {
                    return Err(ServeError::Config(format!(
                        "redir code {} is not a 3xx status",
                        code
                    )));
                }
            }
            if let Some(gzip) = &site.gzip {
                if gzip.level.map_or(false, |level| level > 9) {
                    return Err(ServeError::Config("gzip level must be 0-9".to_string()));
                }
            }
            for rule in &site.rewrite {
                if rule.to.is_empty() {
                    return Err(ServeError::Config(
                        "rewrite rule needs at least one 'to' target".to_string(),
                    ));
                }
            }
            for rule in &site.basicauth {
                if rule.password.is_none() == rule.htpasswd.is_none() {
                    return Err(ServeError::Config(format!(
                        "basicauth for '{}' needs exactly one of password or htpasswd",
                        rule.username
                    )));
                }
            }
            for rule in &site.proxy {
                if rule.upstreams.is_empty() {
                    return Err(ServeError::Config(
                        "proxy rule needs at least one upstream".to_string(),
                    ));
                }
                for upstream in &rule.upstreams {
                    url::Url::parse(upstream).map_err(|e| {
                        ServeError::Config(format!("bad upstream '{}': {}", upstream, e))
                    })?;
                }
            }
            for ext in site.mime.keys() {
                if !ext.starts_with('.') {
                    return Err(ServeError::Config(format!(
                        "mime extension '{}' must start with a dot",
                        ext
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn grace(&self) -> Option<Duration> {
        self.server
            .grace
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
    }
}

/// Durations as `90`, `"90s"`, `"5m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, ServeError> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value
        .parse()
        .map_err(|_| ServeError::Config(format!("bad duration '{}'", s)))?;
    let seconds = match unit {
        "s" | "" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => return Err(ServeError::Config(format!("bad duration unit in '{}'", s))),
    };
    Ok(Duration::from_secs(seconds))
}

fn parse_timeouts(toml: &Option<TimeoutsToml>) -> Result<Timeouts, ServeError> {
    let mut timeouts = Timeouts::default();
    if let Some(t) = toml {
        timeouts.read = t.read.as_deref().map(parse_duration).transpose()?;
        timeouts.read_header = t.read_header.as_deref().map(parse_duration).transpose()?;
        timeouts.write = t.write.as_deref().map(parse_duration).transpose()?;
        timeouts.idle = t.idle.as_deref().map(parse_duration).transpose()?;
    }
    Ok(timeouts)
}

fn conditions(raw: &[[String; 3]]) -> Vec<(String, String, String)> {
    raw.iter()
        .map(|c| (c[0].clone(), c[1].clone(), c[2].clone()))
        .collect()
}

/// Turns one parsed site into a `SiteConfig`, assembling its middleware
/// factories in the fixed directive order.
pub fn build_site(toml: SiteToml, runtime: &RuntimeConfig) -> Result<SiteConfig, ServeError> {
    let addr = address::standardize(&toml.address)?;
    let root = toml.root.unwrap_or_else(|| runtime.default_root.clone());
    let case_sensitive = runtime.case_sensitive_path;

    let mut tls = toml.tls.map(|t| TlsSiteConfig {
        cert: t.cert,
        key: t.key,
        self_signed: t.self_signed,
    });
    if tls.is_none() && (addr.scheme == "https" || addr.port == "443") {
        // Public issuance is out of scope; an https address still has to
        // terminate TLS with something.
        log::warn!(
            "Site {} is https but has no [site.tls]; generating a self-signed certificate",
            addr.original
        );
        tls = Some(TlsSiteConfig {
            self_signed: true,
            ..Default::default()
        });
    }

    let mut middleware: Vec<Middleware> = Vec::new();

    if let Some(log) = toml.log {
        middleware.push(middle::log::middleware(log.format, log.output)?);
    }
    if let Some(gzip) = toml.gzip {
        middleware.push(middle::gzip::middleware(
            gzip.ext,
            gzip.paths,
            gzip.level,
            case_sensitive,
        ));
    }
    if let Some(errors) = toml.errors {
        let mut pages = HashMap::new();
        for (code, page) in errors.pages {
            let code: u16 = code
                .parse()
                .map_err(|_| ServeError::Config(format!("bad error page status '{}'", code)))?;
            pages.insert(code, page);
        }
        middleware.push(middle::errors::middleware(pages, errors.log)?);
    }
    if !toml.header.is_empty() {
        let rules = toml
            .header
            .into_iter()
            .map(|h| middle::headers::HeaderRule {
                path: h.path,
                add: h.add,
                remove: h.remove,
            })
            .collect();
        middleware.push(middle::headers::middleware(rules, case_sensitive));
    }
    if !toml.rewrite.is_empty() {
        let mut rules = Vec::new();
        for r in toml.rewrite {
            rules.push(middle::rewrite::RewriteRule {
                base: r.base.unwrap_or_else(|| "/".to_string()),
                exts: r.ext,
                pattern: r.regexp.as_deref().map(regex::Regex::new).transpose()?,
                matcher: RequestMatcher::parse(&conditions(&r.conditions), r.if_op.as_deref())?,
                to: r.to,
            });
        }
        middleware.push(middle::rewrite::middleware(
            rules,
            root.clone(),
            case_sensitive,
        ));
    }
    if !toml.redir.is_empty() {
        let mut rules = Vec::new();
        for r in toml.redir {
            rules.push(middle::redirect::RedirRule {
                from: r.from.unwrap_or_else(|| "/".to_string()),
                to: r.to,
                code: r.code.unwrap_or(301),
                matcher: RequestMatcher::parse(&conditions(&r.conditions), r.if_op.as_deref())?,
            });
        }
        middleware.push(middle::redirect::middleware(rules, case_sensitive));
    }
    if !toml.ext.is_empty() {
        middleware.push(middle::ext::middleware(toml.ext, root.clone()));
    }
    if !toml.mime.is_empty() {
        middleware.push(middle::mime::middleware(toml.mime));
    }
    if !toml.basicauth.is_empty() {
        let mut rules = Vec::new();
        for rule in toml.basicauth {
            let resources = if rule.resources.is_empty() {
                vec!["/".to_string()]
            } else {
                rule.resources
            };
            let built = match (rule.password, rule.htpasswd) {
                (Some(password), None) => middle::basicauth::Rule::with_password(
                    rule.username,
                    &password,
                    resources,
                    rule.realm,
                ),
                (None, Some(file)) => middle::basicauth::Rule::with_htpasswd(
                    rule.username,
                    file,
                    resources,
                    rule.realm,
                ),
                _ => {
                    return Err(ServeError::Config(
                        "basicauth needs exactly one of password or htpasswd".to_string(),
                    ))
                }
            };
            rules.push(built);
        }
        middleware.push(middle::basicauth::middleware(rules, case_sensitive));
    }
    if !toml.internal.is_empty() {
        middleware.push(middle::internal::middleware(toml.internal, case_sensitive));
    }
    if !toml.proxy.is_empty() {
        let mut rules = Vec::new();
        for rule in toml.proxy {
            let upstreams = rule
                .upstreams
                .iter()
                .map(|u| url::Url::parse(u))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ServeError::Config(format!("bad upstream: {}", e)))?;
            rules.push(middle::proxy::ProxyRule::new(
                rule.path.unwrap_or_else(|| "/".to_string()),
                upstreams,
            ));
        }
        middleware.push(middle::proxy::middleware(rules, case_sensitive));
    }

    Ok(SiteConfig {
        addr,
        listen_host: toml.bind.unwrap_or_default(),
        tls,
        root,
        hidden: toml.hide,
        timeouts: parse_timeouts(&toml.timeouts)?,
        max_header_bytes: toml.max_header_bytes,
        max_body_bytes: toml.max_request_body,
        middleware,
        close_on_mitm: toml.mitm.map(|m| m.close_on_detection).unwrap_or(false),
    })
}

/// Builds all sites from a parsed config.
pub fn build_sites(
    config: AppConfig,
    runtime: &RuntimeConfig,
) -> Result<Vec<SiteConfig>, ServeError> {
    config
        .sites
        .into_iter()
        .map(|site| build_site(site, runtime))
        .collect()
}
