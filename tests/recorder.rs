use parapet::error::CapabilityError;
use parapet::middleware::write_default_body;
use parapet::recorder::{BoxedStream, ResponseRecorder};
use std::io::Read;
use tokio::io::{AsyncReadExt, BufReader, DuplexStream};

fn recorder(http10: bool, head_only: bool, keep_alive: bool) -> (ResponseRecorder, DuplexStream) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let boxed: BoxedStream = Box::new(server);
    let (read_half, write_half) = tokio::io::split(boxed);
    (
        ResponseRecorder::new(
            write_half,
            BufReader::new(read_half),
            http10,
            head_only,
            keep_alive,
            None,
        ),
        client,
    )
}

async fn response_text(rec: ResponseRecorder, mut client: DuplexStream) -> String {
    drop(rec);
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

#[tokio::test]
async fn default_error_body_shape() {
    let (mut rec, client) = recorder(false, false, false);
    write_default_body(&mut rec, 404).await.unwrap();
    rec.finish().await.unwrap();
    assert_eq!(rec.status(), 404);

    let text = response_text(rec, client).await;
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", text);
    assert!(text.contains("Content-Type: text/plain; charset=utf-8"));
    assert!(text.contains("X-Content-Type-Options: nosniff"));
    assert!(text.ends_with("404 Not Found\n"), "{}", text);
}

#[tokio::test]
async fn first_status_wins() {
    let (mut rec, client) = recorder(false, false, false);
    rec.write_header(201).await.unwrap();
    rec.write_header(500).await.unwrap();
    assert_eq!(rec.status(), 201);
    rec.finish().await.unwrap();
    let text = response_text(rec, client).await;
    assert!(text.starts_with("HTTP/1.1 201 Created\r\n"), "{}", text);
}

#[tokio::test]
async fn implicit_200_and_chunked_framing() {
    let (mut rec, client) = recorder(false, false, true);
    rec.write_body(b"hello").await.unwrap();
    assert_eq!(rec.status(), 200);
    assert_eq!(rec.size(), 5);
    rec.finish().await.unwrap();

    let text = response_text(rec, client).await;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
    assert!(text.contains("Transfer-Encoding: chunked"));
    assert!(text.contains("5\r\nhello\r\n0\r\n\r\n"), "{}", text);
}

#[tokio::test]
async fn content_length_suppresses_chunking() {
    let (mut rec, client) = recorder(false, false, true);
    rec.headers_mut().set("Content-Length", "5");
    rec.write_body(b"hello").await.unwrap();
    rec.finish().await.unwrap();
    let text = response_text(rec, client).await;
    assert!(!text.contains("Transfer-Encoding"), "{}", text);
    assert!(text.ends_with("\r\n\r\nhello"), "{}", text);
}

#[tokio::test]
async fn head_requests_count_but_do_not_send() {
    let (mut rec, client) = recorder(false, true, false);
    rec.headers_mut().set("Content-Length", "5");
    rec.write_body(b"hello").await.unwrap();
    assert_eq!(rec.size(), 5);
    rec.finish().await.unwrap();
    let text = response_text(rec, client).await;
    assert!(text.ends_with("\r\n\r\n"), "body leaked: {}", text);
}

#[tokio::test]
async fn capability_errors_are_typed() {
    let (mut rec, _client) = recorder(false, false, true);
    assert_eq!(rec.push("/style.css"), Err(CapabilityError::Push));
    assert!(matches!(rec.close_notify(), Err(CapabilityError::CloseNotify)));

    rec.write_header(200).await.unwrap();
    // Framing already started: the connection can no longer be taken over.
    assert!(matches!(rec.hijack(), Err(CapabilityError::Hijack)));
}

#[tokio::test]
async fn hijack_hands_over_both_halves() {
    let (mut rec, _client) = recorder(false, false, true);
    let conn = rec.hijack().expect("hijackable before header");
    assert!(rec.is_hijacked());
    assert!(!rec.keep_alive());
    drop(conn);

    assert!(matches!(rec.hijack(), Err(CapabilityError::Hijack)));
    assert_eq!(rec.flush().await, Err(CapabilityError::Flush));
}

#[tokio::test]
async fn gzip_encodes_the_body() {
    // HTTP/1.0 keeps the body close-delimited, no chunk parsing needed.
    let (mut rec, client) = recorder(true, false, false);
    rec.enable_gzip(6);
    rec.write_body(b"compress me, repeatedly, compress me").await.unwrap();
    rec.finish().await.unwrap();

    let text_bytes = {
        let rec_status = rec.status();
        assert_eq!(rec_status, 200);
        drop(rec);
        let mut out = Vec::new();
        let mut client = client;
        client.read_to_end(&mut out).await.unwrap();
        out
    };
    let text = String::from_utf8_lossy(&text_bytes);
    assert!(text.contains("Content-Encoding: gzip"), "{}", text);

    let body_start = text_bytes
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header end")
        + 4;
    let mut decoder = flate2::read::GzDecoder::new(&text_bytes[body_start..]);
    let mut decoded = String::new();
    decoder.read_to_string(&mut decoded).unwrap();
    assert_eq!(decoded, "compress me, repeatedly, compress me");
}
