use parapet::replacer::Replacer;
use parapet::request::{Headers, Request, RequestContext};
use std::time::Instant;
use url::Url;

fn make_request(method: &str, url: &str, headers: &[(&str, &str)]) -> Request {
    let url: Url = Url::parse(url).expect("test url");
    let mut header_map = Headers::new();
    for (name, value) in headers {
        header_map.add(*name, *value);
    }
    Request {
        method: method.parse().unwrap(),
        proto: "HTTP/1.1".to_string(),
        ctx: RequestContext {
            request_id: "test-id".to_string(),
            original_url: url.clone(),
            remote_user: None,
            mitm: None,
            replacer: Replacer::new(""),
            received_at: Instant::now(),
        },
        url,
        headers: header_map,
        remote_addr: "127.0.0.1:5555".parse().unwrap(),
        body: Vec::new(),
    }
}

#[test]
fn request_placeholders_and_sigils() {
    let req = make_request(
        "POST",
        "http://localhost.local/?foo=bar",
        &[
            ("Host", "localhost.local"),
            ("Custom", "foobarbaz"),
            ("Cookie", "taste=delicious"),
        ],
    );
    let rep = Replacer::new("");
    let out = rep.replace("{method} {host} {?foo} {~taste} {>Custom}", &req, None);
    assert_eq!(out, "POST localhost.local bar delicious foobarbaz");
}

#[test]
fn plain_strings_pass_through_unchanged() {
    let req = make_request("GET", "http://h/", &[]);
    let rep = Replacer::new("-");
    assert_eq!(rep.replace("no placeholders here", &req, None), "no placeholders here");
}

#[test]
fn custom_values_take_precedence() {
    let req = make_request("GET", "http://h/x", &[]);
    let mut rep = Replacer::new("");
    rep.set("k", "v");
    assert_eq!(rep.replace("{k}", &req, None), "v");

    // Even over a well-known key.
    rep.set("method", "SPOOFED");
    assert_eq!(rep.replace("{method}", &req, None), "SPOOFED");
}

#[test]
fn unmatched_tokens_become_empty_value() {
    let req = make_request("GET", "http://h/", &[]);
    let rep = Replacer::new("-");
    assert_eq!(rep.replace("[{no_such_thing}]", &req, None), "[-]");
    let rep = Replacer::new("EMPTY");
    assert_eq!(rep.replace("{nope}", &req, None), "EMPTY");
}

#[test]
fn unterminated_token_is_left_verbatim() {
    let req = make_request("GET", "http://h/", &[]);
    let rep = Replacer::new("-");
    assert_eq!(rep.replace("{method} {unclosed", &req, None), "GET {unclosed");
}

#[test]
fn original_url_survives_rewrite() {
    let mut req = make_request("GET", "http://h/original?q=1", &[]);
    req.url.set_path("/rewritten");
    req.url.set_query(None);

    let rep = Replacer::new("");
    assert_eq!(rep.replace("{path}", &req, None), "/original");
    assert_eq!(rep.replace("{uri}", &req, None), "/original?q=1");
    assert_eq!(rep.replace("{query}", &req, None), "q=1");
    assert_eq!(rep.replace("{rewrite_path}", &req, None), "/rewritten");
    assert_eq!(rep.replace("{rewrite_uri}", &req, None), "/rewritten");
}

#[test]
fn host_family_keys() {
    let req = make_request("GET", "http://h/", &[("Host", "example.com:8080")]);
    let rep = Replacer::new("");
    assert_eq!(rep.replace("{host}", &req, None), "example.com:8080");
    assert_eq!(rep.replace("{hostonly}", &req, None), "example.com");
    assert_eq!(rep.replace("{port}", &req, None), "8080");

    // No splittable port: {hostonly} falls back to the full host.
    let req = make_request("GET", "http://h/", &[("Host", "plainhost")]);
    assert_eq!(rep.replace("{hostonly}", &req, None), "plainhost");
}

#[test]
fn request_dump_is_single_line() {
    let req = make_request("GET", "http://h/a", &[("Host", "h"), ("X-Two", "2")]);
    let rep = Replacer::new("");
    let dump = rep.replace("{request}", &req, None);
    assert!(!dump.contains('\n'), "raw newline in: {}", dump);
    assert!(dump.contains("\\r\\n"), "escapes missing in: {}", dump);
    assert!(dump.starts_with("GET /a HTTP/1.1"));
}

#[test]
fn request_body_is_gated_and_bounded() {
    let mut req = make_request(
        "POST",
        "http://h/",
        &[("Content-Type", "application/json")],
    );
    req.body = b"{\"a\":1}".to_vec();
    let rep = Replacer::new("-");
    assert_eq!(rep.replace("{request_body}", &req, None), "{\"a\":1}");

    // Non-JSON/XML content types are not captured.
    let mut req = make_request("POST", "http://h/", &[("Content-Type", "text/plain")]);
    req.body = b"hello".to_vec();
    assert_eq!(rep.replace("{request_body}", &req, None), "-");

    // GET bodies are never captured.
    let req = make_request("GET", "http://h/", &[("Content-Type", "application/json")]);
    assert_eq!(rep.replace("{request_body}", &req, None), "-");
}

#[test]
fn remote_and_user() {
    let mut req = make_request("GET", "http://h/", &[]);
    let rep = Replacer::new("-");
    assert_eq!(rep.replace("{remote}", &req, None), "127.0.0.1");
    assert_eq!(rep.replace("{user}", &req, None), "-");
    req.ctx.remote_user = Some("alice".to_string());
    assert_eq!(rep.replace("{user}", &req, None), "alice");
}

#[test]
fn status_and_size_need_a_recorder() {
    let req = make_request("GET", "http://h/", &[]);
    let rep = Replacer::new("-");
    assert_eq!(rep.replace("{status} {size} {latency}", &req, None), "- - -");
}
