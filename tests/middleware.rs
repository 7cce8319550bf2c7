use async_trait::async_trait;
use parapet::middleware::{
    compile, select_config, status_text, Handler, HandlerRef, Middleware, ServeResult,
    DIRECTIVE_ORDER,
};
use parapet::recorder::{BoxedStream, ResponseRecorder};
use parapet::replacer::Replacer;
use parapet::request::{Headers, Request, RequestContext};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, BufReader, DuplexStream};
use url::Url;

fn make_request(url: &str) -> Request {
    let url: Url = Url::parse(url).expect("test url");
    Request {
        method: "GET".parse().unwrap(),
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
        headers: Headers::new(),
        remote_addr: "127.0.0.1:5555".parse().unwrap(),
        body: Vec::new(),
    }
}

fn recorder() -> (ResponseRecorder, DuplexStream) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let boxed: BoxedStream = Box::new(server);
    let (read_half, write_half) = tokio::io::split(boxed);
    (
        ResponseRecorder::new(write_half, BufReader::new(read_half), false, false, false, None),
        client,
    )
}

struct Tracer {
    name: &'static str,
    next: Option<HandlerRef>,
    trace: Arc<Mutex<Vec<&'static str>>>,
    status: u16,
}

#[async_trait]
impl Handler for Tracer {
    async fn serve(&self, w: &mut ResponseRecorder, r: &mut Request) -> ServeResult {
        self.trace.lock().unwrap().push(self.name);
        match &self.next {
            Some(next) => next.serve(w, r).await,
            None => Ok(self.status),
        }
    }
}

fn tracing_mw(
    name: &'static str,
    trace: Arc<Mutex<Vec<&'static str>>>,
) -> Middleware {
    Box::new(move |next| {
        Arc::new(Tracer {
            name,
            next: Some(next),
            trace,
            status: 0,
        })
    })
}

#[tokio::test]
async fn chain_folds_right_to_left() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let terminal: HandlerRef = Arc::new(Tracer {
        name: "terminal",
        next: None,
        trace: trace.clone(),
        status: 0,
    });
    let chain = compile(
        vec![
            tracing_mw("outer", trace.clone()),
            tracing_mw("inner", trace.clone()),
        ],
        terminal,
    );

    let (mut rec, _client) = recorder();
    let mut req = make_request("http://h/");
    chain.serve(&mut rec, &mut req).await.unwrap();
    assert_eq!(*trace.lock().unwrap(), vec!["outer", "inner", "terminal"]);
}

#[tokio::test]
async fn zero_status_means_handled() {
    struct Writes;

    #[async_trait]
    impl Handler for Writes {
        async fn serve(&self, w: &mut ResponseRecorder, _r: &mut Request) -> ServeResult {
            w.headers_mut().set("Content-Length", "2");
            w.write_body(b"ok").await?;
            Ok(0)
        }
    }

    let (mut rec, client) = recorder();
    let mut req = make_request("http://h/");
    let status = Writes.serve(&mut rec, &mut req).await.unwrap();

    // The entry point's contract: only an unwritten >= 400 status gets the
    // default body. This one is fully handled.
    assert_eq!(status, 0);
    assert!(rec.wrote_header());
    rec.finish().await.unwrap();

    drop(rec);
    let mut client = client;
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    let text = String::from_utf8_lossy(&out);
    assert!(text.ends_with("\r\n\r\nok"), "{}", text);
    assert!(!text.contains("Not Found"));
}

#[test]
fn longest_base_path_selected() {
    let configs = vec![("/a".to_string(), 1u32), ("/a/b".to_string(), 2u32)];
    assert_eq!(select_config(&configs, "/a/b/c", true), Some(&2));
    assert_eq!(select_config(&configs, "/a/x", true), Some(&1));
    assert_eq!(select_config(&configs, "/z", true), None);
}

#[test]
fn directive_order_is_stable() {
    let log_pos = DIRECTIVE_ORDER.iter().position(|d| *d == "log").unwrap();
    let rewrite_pos = DIRECTIVE_ORDER.iter().position(|d| *d == "rewrite").unwrap();
    let proxy_pos = DIRECTIVE_ORDER.iter().position(|d| *d == "proxy").unwrap();
    assert!(log_pos < rewrite_pos && rewrite_pos < proxy_pos);
}

#[test]
fn status_texts() {
    assert_eq!(status_text(200), "OK");
    assert_eq!(status_text(404), "Not Found");
    assert_eq!(status_text(500), "Internal Server Error");
    assert_eq!(status_text(999), "");
}
