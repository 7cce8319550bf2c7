use parapet::mitm::{self, parse_client_hello, MitmVerdict, RawClientHello};
use parapet::request::Headers;

const FIREFOX_CIPHERS: [u16; 13] = [
    0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc00a, 0xc009, 0xc013, 0xc014, 0x002f,
    0x0035, 0x000a,
];
const TOR_CIPHERS: [u16; 11] = [
    0xc02b, 0xc02f, 0xc02c, 0xc030, 0xc00a, 0xc009, 0xc013, 0xc014, 0x002f, 0x0035, 0x000a,
];
const SAFARI_CIPHERS: [u16; 18] = [
    0xc02c, 0xc02b, 0xc024, 0xc023, 0xc00a, 0xc009, 0xc030, 0xc02f, 0xc028, 0xc027, 0xc014,
    0xc013, 0x009d, 0x009c, 0x003d, 0x003c, 0x0035, 0x002f,
];

/// Serializes a handshake message the way a TLS stack would put it on the
/// wire (without the 5-byte record header).
fn build_hello(ciphers: &[u16], extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x0303u16.to_be_bytes()); // client_version
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session id
    body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
    for suite in ciphers {
        body.extend_from_slice(&suite.to_be_bytes());
    }
    body.extend_from_slice(&[1, 0]); // compression: null
    let mut exts = Vec::new();
    for (id, data) in extensions {
        exts.extend_from_slice(&id.to_be_bytes());
        exts.extend_from_slice(&(data.len() as u16).to_be_bytes());
        exts.extend_from_slice(data);
    }
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut msg = vec![0x01];
    msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.extend_from_slice(&body);
    msg
}

fn groups_ext(curves: &[u16]) -> (u16, Vec<u8>) {
    let mut data = ((curves.len() * 2) as u16).to_be_bytes().to_vec();
    for curve in curves {
        data.extend_from_slice(&curve.to_be_bytes());
    }
    (10, data)
}

fn points_ext(points: &[u8]) -> (u16, Vec<u8>) {
    let mut data = vec![points.len() as u8];
    data.extend_from_slice(points);
    (11, data)
}

fn headers(pairs: &[(&str, &str)]) -> Headers {
    let mut h = Headers::new();
    for (name, value) in pairs {
        h.add(*name, *value);
    }
    h
}

#[test]
fn parse_roundtrip() {
    let raw = build_hello(
        &[0x1301, 0xc02b],
        &[
            (0, vec![]),
            groups_ext(&[29, 23]),
            points_ext(&[0]),
            (16, vec![]),
        ],
    );
    let hello = parse_client_hello(&raw);
    assert_eq!(hello.version, 0x0303);
    assert_eq!(hello.cipher_suites, vec![0x1301, 0xc02b]);
    assert_eq!(hello.compression_methods, vec![0]);
    assert_eq!(hello.extensions, vec![0, 10, 11, 16]);
    assert_eq!(hello.curves, vec![29, 23]);
    assert_eq!(hello.points, vec![0]);
}

#[test]
fn malformed_hellos_parse_to_empty() {
    assert_eq!(parse_client_hello(&[]), RawClientHello::default());
    assert_eq!(parse_client_hello(&[0x02, 0, 0, 1, 0]), RawClientHello::default());
    // Truncated mid-ciphers.
    let mut raw = build_hello(&[0xc02b], &[]);
    raw.truncate(raw.len() - 4);
    assert_eq!(parse_client_hello(&raw), RawClientHello::default());
}

#[test]
fn heartbeat_means_interception() {
    let raw = build_hello(&[0x1301], &[(15, vec![1])]);
    let hello = parse_client_hello(&raw);
    let verdict = mitm::assess(&hello, &headers(&[("User-Agent", "anything")]));
    assert_eq!(verdict, MitmVerdict::Likely);
}

#[test]
fn middlebox_headers_mean_interception() {
    let hello = RawClientHello::default();
    let verdict = mitm::assess(
        &hello,
        &headers(&[("User-Agent", "Mozilla"), ("X-BlueCoat-Via", "abc")]),
    );
    assert_eq!(verdict, MitmVerdict::Likely);
    let verdict = mitm::assess(&hello, &headers(&[("X-FCCKV2", "1")]));
    assert_eq!(verdict, MitmVerdict::Likely);
}

#[test]
fn chrome_requires_grease() {
    let ua = ("User-Agent", "Mozilla/5.0 Chrome/124.0 Safari/537.36");
    let with_grease = parse_client_hello(&build_hello(
        &[0x2a2a, 0x1301, 0xc02b],
        &[groups_ext(&[29, 23, 24])],
    ));
    assert_eq!(mitm::assess(&with_grease, &headers(&[ua])), MitmVerdict::Unlikely);

    let without_grease = parse_client_hello(&build_hello(
        &[0x1301, 0xc02b],
        &[groups_ext(&[29, 23, 24])],
    ));
    assert_eq!(mitm::assess(&without_grease, &headers(&[ua])), MitmVerdict::Likely);
}

#[test]
fn chrome_never_offers_excluded_suites() {
    let ua = ("User-Agent", "Mozilla/5.0 Chrome/124.0 Safari/537.36");
    let hello = parse_client_hello(&build_hello(
        &[0x2a2a, 0x1301, 0x0033],
        &[groups_ext(&[29, 23])],
    ));
    assert_eq!(mitm::assess(&hello, &headers(&[ua])), MitmVerdict::Likely);

    // Curve 25 is not in Chrome's repertoire either.
    let hello = parse_client_hello(&build_hello(
        &[0x2a2a, 0x1301],
        &[groups_ext(&[29, 25])],
    ));
    assert_eq!(mitm::assess(&hello, &headers(&[ua])), MitmVerdict::Likely);
}

#[test]
fn edge_wants_stapling_before_curves() {
    let ua = ("User-Agent", "Mozilla/5.0 ... Edge/18.0");
    let good = parse_client_hello(&build_hello(
        &[0x1301, 0xc02b],
        &[(0, vec![]), (5, vec![]), groups_ext(&[29]), points_ext(&[0])],
    ));
    assert_eq!(mitm::assess(&good, &headers(&[ua])), MitmVerdict::Unlikely);

    let reordered = parse_client_hello(&build_hello(
        &[0x1301, 0xc02b],
        &[(5, vec![]), (0, vec![]), groups_ext(&[29]), points_ext(&[0])],
    ));
    assert_eq!(mitm::assess(&reordered, &headers(&[ua])), MitmVerdict::Likely);

    // RC4 disqualifies outright.
    let rc4 = parse_client_hello(&build_hello(
        &[0x0005],
        &[(5, vec![]), groups_ext(&[29]), points_ext(&[0])],
    ));
    assert_eq!(mitm::assess(&rc4, &headers(&[ua])), MitmVerdict::Likely);
}

#[test]
fn firefox_fingerprint() {
    let ua = ("User-Agent", "Mozilla/5.0 (X11; Linux) Gecko/20100101 Firefox/126.0");
    let exts = vec![
        (0u16, vec![]),
        (23, vec![]),
        (65281, vec![0]),
        groups_ext(&[29, 23, 24, 25]),
        points_ext(&[0]),
        (35, vec![]),
        (16, vec![]),
        (5, vec![]),
        (13, vec![]),
    ];
    let good = parse_client_hello(&build_hello(&FIREFOX_CIPHERS, &exts));
    assert_eq!(mitm::assess(&good, &headers(&[ua])), MitmVerdict::Unlikely);

    // A GREASE value is distinctly not NSS.
    let mut greased = FIREFOX_CIPHERS.to_vec();
    greased.insert(0, 0x3a3a);
    let bad = parse_client_hello(&build_hello(&greased, &exts));
    assert_eq!(mitm::assess(&bad, &headers(&[ua])), MitmVerdict::Likely);

    // Wrong curve set.
    let mut wrong_curves = exts.clone();
    wrong_curves[3] = groups_ext(&[23, 29]);
    let bad = parse_client_hello(&build_hello(&FIREFOX_CIPHERS, &wrong_curves));
    assert_eq!(mitm::assess(&bad, &headers(&[ua])), MitmVerdict::Likely);
}

#[test]
fn tor_is_accepted_for_esr_firefox_on_windows() {
    let ua = (
        "User-Agent",
        "Mozilla/5.0 (Windows NT 6.1; rv:52.0) Gecko/20100101 Firefox/52.0",
    );
    // No NSS extension layout, but the ESR cipher order.
    let hello = parse_client_hello(&build_hello(&TOR_CIPHERS, &[]));
    assert_eq!(mitm::assess(&hello, &headers(&[ua])), MitmVerdict::Unlikely);
}

#[test]
fn safari_leads_with_scsv() {
    let ua = ("User-Agent", "Mozilla/5.0 Version/16.5 Safari/605.1.15");
    let mut suites = vec![0x00ff];
    suites.extend_from_slice(&SAFARI_CIPHERS);
    let good = parse_client_hello(&build_hello(&suites, &[]));
    assert_eq!(mitm::assess(&good, &headers(&[ua])), MitmVerdict::Unlikely);

    let no_scsv = parse_client_hello(&build_hello(&SAFARI_CIPHERS, &[]));
    assert_eq!(mitm::assess(&no_scsv, &headers(&[ua])), MitmVerdict::Likely);
}

#[test]
fn unrecognized_user_agents_stay_unknown() {
    let hello = parse_client_hello(&build_hello(&[0x1301], &[]));
    let verdict = mitm::assess(&hello, &headers(&[("User-Agent", "curl/8.5.0")]));
    assert_eq!(verdict, MitmVerdict::Unknown);
    let verdict = mitm::assess(&hello, &Headers::new());
    assert_eq!(verdict, MitmVerdict::Unknown);
}

#[test]
fn hello_table_roundtrip() {
    let addr: std::net::SocketAddr = "192.0.2.7:44321".parse().unwrap();
    assert!(mitm::recall(&addr).is_none());
    let hello = parse_client_hello(&build_hello(&[0x1301], &[]));
    mitm::remember(addr, hello.clone());
    assert_eq!(mitm::recall(&addr), Some(hello));
    mitm::forget(&addr);
    assert!(mitm::recall(&addr).is_none());
}

#[tokio::test]
async fn capture_consumes_exactly_one_record() {
    let (mut client, mut server) = tokio::io::duplex(4096);
    let msg = build_hello(&[0x1301, 0xc02b], &[groups_ext(&[29])]);
    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    record.extend_from_slice(&msg);
    record.extend_from_slice(b"TRAILING");

    use tokio::io::AsyncWriteExt;
    client.write_all(&record).await.unwrap();

    let (consumed, hello) = mitm::capture(&mut server).await.unwrap();
    assert_eq!(consumed.len(), 5 + msg.len());
    assert_eq!(&record[..consumed.len()], &consumed[..]);
    assert_eq!(hello.cipher_suites, vec![0x1301, 0xc02b]);
    assert_eq!(hello.curves, vec![29]);
}

#[tokio::test]
async fn capture_tolerates_non_tls_bytes() {
    let (mut client, mut server) = tokio::io::duplex(4096);
    use tokio::io::AsyncWriteExt;
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let (consumed, hello) = mitm::capture(&mut server).await.unwrap();
    assert_eq!(consumed, b"GET /".to_vec());
    assert_eq!(hello, RawClientHello::default());
}
