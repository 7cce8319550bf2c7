use parapet::address::{standardize, Address};

#[test]
fn scheme_fills_default_port() {
    let addr = standardize("http://host").expect("parse");
    assert_eq!(addr.scheme, "http");
    assert_eq!(addr.host, "host");
    assert_eq!(addr.port, "80");
}

#[test]
fn https_fills_443() {
    let addr = standardize("https://example.com").expect("parse");
    assert_eq!(addr.port, "443");
}

#[test]
fn conflicting_scheme_and_port_rejected() {
    assert!(standardize("https://host:80").is_err());
    assert!(standardize("http://host:443").is_err());
}

#[test]
fn scheme_specified_twice_rejected() {
    assert!(standardize("http://host:https").is_err());
    assert!(standardize("https://host:http").is_err());
}

#[test]
fn bare_port_and_path() {
    let addr = standardize(":1234/asdf").expect("parse");
    assert_eq!(addr.scheme, "");
    assert_eq!(addr.host, "");
    assert_eq!(addr.port, "1234");
    assert_eq!(addr.path, "/asdf");
}

#[test]
fn textual_port_sets_scheme() {
    let addr = standardize("host:https").expect("parse");
    assert_eq!(addr.scheme, "https");
    assert_eq!(addr.port, "443");

    let addr = standardize("host:http/path").expect("parse");
    assert_eq!(addr.scheme, "http");
    assert_eq!(addr.port, "80");
    assert_eq!(addr.path, "/path");
}

#[test]
fn ipv6_literal_hosts() {
    let addr = standardize("[::1]:2015").expect("parse");
    assert_eq!(addr.host, "[::1]");
    assert_eq!(addr.port, "2015");
}

#[test]
fn display_suppresses_default_ports() {
    assert_eq!(standardize("http://host").unwrap().to_string(), "http://host");
    assert_eq!(
        standardize("http://host:1234").unwrap().to_string(),
        "http://host:1234"
    );
    assert_eq!(
        standardize("https://host:443/x").unwrap().to_string(),
        "https://host/x"
    );
    assert_eq!(Address::default().to_string(), "");
}

#[test]
fn standardize_display_roundtrip_reaches_a_fixed_point() {
    // The display form fills in a scheme, so one normalization pass may
    // change the address; after that it must be stable.
    for input in [
        "http://host",
        "https://example.com/path",
        "host:8080",
        "example.com/foo/bar",
        "https://example.com:8443",
    ] {
        let once = standardize(input).expect("first pass");
        let twice = standardize(&once.to_string()).expect("second pass");
        let thrice = standardize(&twice.to_string()).expect("third pass");
        assert_eq!(twice, thrice, "{}", input);
        assert_eq!(twice.to_string(), thrice.to_string(), "{}", input);
    }
}

#[test]
fn vhost_key_strips_scheme_only() {
    let addr = standardize("https://example.com:8443/app").expect("parse");
    assert_eq!(addr.vhost_key(), "example.com:8443/app");

    let addr = standardize("example.com/app").expect("parse");
    assert_eq!(addr.vhost_key(), "example.com/app");
}
