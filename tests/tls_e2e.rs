use parapet::config::{build_sites, AppConfig, RuntimeConfig};
use parapet::server::build_servers;
use std::time::Duration;

fn test_root() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("parapet-tls-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create test root");
    dir
}

#[tokio::test]
async fn terminates_tls_with_a_generated_certificate() {
    let root = test_root();
    std::fs::write(root.join("hello.txt"), "over tls").unwrap();

    let config = format!(
        r#"
[[site]]
address = "127.0.0.1:0"
root = "{root}"

[site.tls]
self_signed = true

[[site.header]]
path = "/"
add = [["X-Mitm", "{{mitm}}"]]
"#,
        root = root.display()
    );
    let app = AppConfig::from_toml(&config).expect("parse");
    let runtime = RuntimeConfig::default();
    let sites = build_sites(app, &runtime).expect("build sites");
    let servers = build_servers(sites, &runtime).expect("build servers");
    let server = servers.into_iter().next().unwrap();
    assert!(server.is_tls());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve_on(listener).await;
    });

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .expect("client");
    let response = client
        .get(format!("https://127.0.0.1:{}/hello.txt", addr.port()))
        .send()
        .await
        .expect("https request");
    assert_eq!(response.status().as_u16(), 200);

    // No browser User-Agent was sent, so the classifier cannot commit.
    assert_eq!(
        response
            .headers()
            .get("X-Mitm")
            .and_then(|v| v.to_str().ok()),
        Some("unknown")
    );
    assert_eq!(response.text().await.expect("body"), "over tls");

    server.stop(Duration::from_secs(2)).await;
}
