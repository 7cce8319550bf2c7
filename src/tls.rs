//! TLS termination glue: certificate loading (PEM or generated), SNI
//! resolution across a listener group's sites, and session-ticket key
//! rotation.

use crate::error::ServeError;
use crate::site::SiteConfig;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ProducesTickets, ResolvesServerCertUsingSni};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// How often session-ticket keys are re-generated.
pub const TICKET_ROTATION_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Builds one rustls config for a listener group, or `None` when no site
/// in the group terminates TLS. Certificates are resolved by SNI when the
/// group hosts more than one site.
pub fn build_server_config(
    sites: &[&SiteConfig],
    ticketer: Arc<RotatingTicketer>,
) -> Result<Option<Arc<ServerConfig>>, ServeError> {
    let mut keys: Vec<(String, CertifiedKey)> = Vec::new();
    for site in sites {
        let tls = match &site.tls {
            Some(tls) => tls,
            None => continue,
        };
        let certified = if tls.self_signed {
            generate_self_signed(&site.addr.host)?
        } else {
            match (&tls.cert, &tls.key) {
                (Some(cert), Some(key)) => load_pem_pair(cert, key)?,
                _ => {
                    return Err(ServeError::Config(format!(
                        "site {} enables tls without cert/key or self_signed",
                        site.addr.original
                    )))
                }
            }
        };
        keys.push((site.addr.host.clone(), certified));
    }
    if keys.is_empty() {
        return Ok(None);
    }

    // Name the provider explicitly; other dependencies may compile rustls
    // with a second one, which makes the process default ambiguous.
    let builder = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
        .with_no_client_auth();
    let mut config = if keys.len() == 1 {
        let (_, certified) = keys.remove(0);
        builder.with_cert_resolver(Arc::new(SingleCert(Arc::new(certified))))
    } else {
        let mut resolver = ResolvesServerCertUsingSni::new();
        for (host, certified) in keys {
            if let Err(e) = resolver.add(&host, certified) {
                log::warn!("Cannot serve certificate for '{}': {}", host, e);
            }
        }
        builder.with_cert_resolver(Arc::new(resolver))
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config.ticketer = ticketer;
    Ok(Some(Arc::new(config)))
}

#[derive(Debug)]
struct SingleCert(Arc<CertifiedKey>);

impl rustls::server::ResolvesServerCert for SingleCert {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn load_pem_pair(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<CertifiedKey, ServeError> {
    let mut cert_reader = BufReader::new(std::fs::File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader).collect::<Result<_, _>>()?;
    let mut key_reader = BufReader::new(std::fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
        ServeError::Config(format!("no private key found in {}", key_path.display()))
    })?;
    let signing_key = aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| ServeError::Config(format!("unusable private key: {}", e)))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// In-memory certificate for sites that opt into `self_signed`. Automatic
/// public issuance is a deployment concern; this keeps local TLS one line
/// of config.
fn generate_self_signed(host: &str) -> Result<CertifiedKey, ServeError> {
    let name = if host.is_empty() { "localhost" } else { host };
    let generated = rcgen::generate_simple_self_signed(vec![name.to_string()])
        .map_err(|e| ServeError::Config(format!("self-signed generation failed: {}", e)))?;
    let cert = generated.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der());
    let signing_key = aws_lc_rs::sign::any_supported_type(&PrivateKeyDer::from(key_der))
        .map_err(|e| ServeError::Config(format!("unusable generated key: {}", e)))?;
    Ok(CertifiedKey::new(vec![cert], signing_key))
}

/// Session-ticket producer whose keys a background task replaces on an
/// interval. The previous key stays valid for one rotation so tickets
/// issued just before a roll still resume.
pub struct RotatingTicketer {
    keys: RwLock<(Arc<dyn ProducesTickets>, Option<Arc<dyn ProducesTickets>>)>,
}

impl RotatingTicketer {
    pub fn new() -> Result<Arc<Self>, ServeError> {
        let initial = aws_lc_rs::Ticketer::new()?;
        Ok(Arc::new(Self {
            keys: RwLock::new((initial, None)),
        }))
    }

    /// Installs a fresh key, demoting the current one to decrypt-only.
    pub fn rotate(&self) {
        let fresh = match aws_lc_rs::Ticketer::new() {
            Ok(ticketer) => ticketer,
            Err(e) => {
                log::error!("Session ticket rotation failed: {}", e);
                return;
            }
        };
        if let Ok(mut keys) = self.keys.write() {
            let old = keys.0.clone();
            *keys = (fresh, Some(old));
        }
    }
}

impl std::fmt::Debug for RotatingTicketer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RotatingTicketer")
    }
}

impl ProducesTickets for RotatingTicketer {
    fn enabled(&self) -> bool {
        true
    }

    fn lifetime(&self) -> u32 {
        TICKET_ROTATION_INTERVAL.as_secs() as u32
    }

    fn encrypt(&self, plain: &[u8]) -> Option<Vec<u8>> {
        self.keys.read().ok()?.0.encrypt(plain)
    }

    fn decrypt(&self, cipher: &[u8]) -> Option<Vec<u8>> {
        let keys = self.keys.read().ok()?;
        keys.0
            .decrypt(cipher)
            .or_else(|| keys.1.as_ref().and_then(|prev| prev.decrypt(cipher)))
    }
}

/// Replays already-consumed bytes (the captured ClientHello) ahead of the
/// live stream, so the TLS stack sees an untouched connection.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
