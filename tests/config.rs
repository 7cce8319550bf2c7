use parapet::config::{build_sites, parse_duration, AppConfig, RuntimeConfig};
use parapet::error::ServeError;
use parapet::server::build_servers;
use parapet::site::{merge_size_cap, merge_timeouts, Timeouts};
use std::time::Duration;

const FULL_SITE: &str = r#"
[server]
grace = "10s"

[[site]]
address = "https://example.com"
root = "/srv/www"
hide = [".git", "/private"]
max_header_bytes = 16384
max_request_body = 1048576

[site.tls]
self_signed = true

[site.timeouts]
read = "30s"
read_header = "5s"
idle = "2m"

[site.log]
format = "combined"

[site.gzip]
ext = [".html", ".css"]

[site.errors]
pages = { "404" = "/srv/errors/404.html" }

[[site.header]]
path = "/"
add = [["Strict-Transport-Security", "max-age=31536000"]]
remove = ["Server"]

[[site.rewrite]]
base = "/app"
to = ["{path}", "/index.html"]
if = [["{path}", "not_ends_with", ".css"]]
if_op = "and"

[[site.redir]]
from = "/moved"
to = "https://elsewhere.test{uri}"
code = 308

[site.mime]
".wasm" = "application/wasm"

[[site.basicauth]]
username = "ops"
password = "hunter2"
resources = ["/admin"]

[[site.proxy]]
path = "/api"
upstreams = ["http://127.0.0.1:9000"]
"#;

#[test]
fn full_config_parses_and_builds() {
    let app = AppConfig::from_toml(FULL_SITE).expect("parse");
    app.validate().expect("validate");
    assert_eq!(app.grace(), Some(Duration::from_secs(10)));

    let runtime = RuntimeConfig::default();
    let sites = build_sites(app, &runtime).expect("build");
    assert_eq!(sites.len(), 1);
    let site = &sites[0];
    assert_eq!(site.addr.scheme, "https");
    assert_eq!(site.addr.port, "443");
    assert!(site.tls.is_some());
    assert_eq!(site.hidden, vec![".git".to_string(), "/private".to_string()]);
    assert_eq!(site.timeouts.read, Some(Duration::from_secs(30)));
    assert_eq!(site.timeouts.idle, Some(Duration::from_secs(120)));
    assert_eq!(site.timeouts.write, None);
    assert_eq!(site.max_header_bytes, Some(16384));
    // log, gzip, errors, header, rewrite, redir, mime, basicauth, proxy
    assert_eq!(site.middleware.len(), 9);
}

#[test]
fn https_address_without_tls_gets_self_signed() {
    let app = AppConfig::from_toml("[[site]]\naddress = \"https://localhost\"\n").unwrap();
    let sites = build_sites(app, &RuntimeConfig::default()).unwrap();
    let tls = sites[0].tls.as_ref().expect("tls implied");
    assert!(tls.self_signed);
}

#[test]
fn validation_catches_bad_configs() {
    let bad_redir = "[[site]]\naddress = \"h\"\n[[site.redir]]\nto = \"/x\"\ncode = 200\n";
    assert!(AppConfig::from_toml(bad_redir).unwrap().validate().is_err());

    let bad_upstream = "[[site]]\naddress = \"h\"\n[[site.proxy]]\nupstreams = [\"not a url\"]\n";
    assert!(AppConfig::from_toml(bad_upstream).unwrap().validate().is_err());

    let bad_auth =
        "[[site]]\naddress = \"h\"\n[[site.basicauth]]\nusername = \"u\"\n";
    assert!(AppConfig::from_toml(bad_auth).unwrap().validate().is_err());

    let bad_mime = "[[site]]\naddress = \"h\"\n[site.mime]\nwasm = \"application/wasm\"\n";
    assert!(AppConfig::from_toml(bad_mime).unwrap().validate().is_err());

    let bad_address = "[[site]]\naddress = \"https://h:80\"\n";
    assert!(AppConfig::from_toml(bad_address).unwrap().validate().is_err());
}

#[test]
fn unknown_fields_are_rejected() {
    assert!(AppConfig::from_toml("[[site]]\naddress = \"h\"\nbogus = 1\n").is_err());
}

#[test]
fn durations() {
    assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
    assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
    assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
    assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    assert!(parse_duration("5fortnights").is_err());
}

#[test]
fn duplicate_vhost_keys_are_rejected() {
    let config = r#"
[[site]]
address = "example.com:8080"

[[site]]
address = "EXAMPLE.com:8080"
"#;
    let app = AppConfig::from_toml(config).unwrap();
    let sites = build_sites(app, &RuntimeConfig::default()).unwrap();
    match build_servers(sites, &RuntimeConfig::default()) {
        Err(ServeError::DuplicateSite(_)) => {}
        other => panic!("expected duplicate-site, got {:?}", other.map(|v| v.len())),
    }
}

#[test]
fn strictest_timeout_wins_in_a_group() {
    let a = Timeouts {
        read: Some(Duration::from_secs(30)),
        read_header: None,
        write: Some(Duration::ZERO),
        idle: Some(Duration::from_secs(60)),
    };
    let b = Timeouts {
        read: Some(Duration::from_secs(10)),
        read_header: None,
        write: Some(Duration::from_secs(20)),
        idle: None,
    };
    let merged = merge_timeouts([&a, &b].into_iter());
    assert_eq!(merged.read, Some(Duration::from_secs(10)));
    // Nobody set it: the default applies.
    assert_eq!(merged.read_header, Some(parapet::site::DEFAULT_READ_HEADER_TIMEOUT));
    // Zero-meant loses to a positive setting.
    assert_eq!(merged.write, Some(Duration::from_secs(20)));
    assert_eq!(merged.idle, Some(Duration::from_secs(60)));

    // All-zero means explicitly disabled.
    let z = Timeouts {
        read: Some(Duration::ZERO),
        ..Default::default()
    };
    let merged = merge_timeouts([&z].into_iter());
    assert_eq!(merged.read, None);
}

#[test]
fn smallest_header_cap_wins() {
    assert_eq!(
        merge_size_cap([Some(4096), None, Some(1024)].into_iter()),
        Some(1024)
    );
    assert_eq!(merge_size_cap([None, None].into_iter()), None);
}
