use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig, SupportedProtocolVersion,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, UnixListener},
};
use tokio_rustls::TlsAcceptor;

use crate::config::{RelayConfig, TlsVersion};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

static TLS12_AND_UP: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

enum Inner {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// Bound relay endpoint. Accepted streams are returned before any TLS
/// handshake, which is left to the connection task.
pub struct Listener {
    inner: Inner,
    tls: Option<TlsAcceptor>,
}

pub enum Accepted {
    Plain(Box<dyn AsyncStream>),
    Tls(tokio_rustls::Accept<Box<dyn AsyncStream>>),
}

impl Listener {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let tls = if config.tls_support {
            Some(tls_acceptor(config)?)
        } else {
            None
        };
        let inner = match &config.sock_path {
            Some(path) => {
                if path.exists() {
                    std::fs::remove_file(path).with_context(|| {
                        format!("failed to remove stale socket {}", path.display())
                    })?;
                }
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("failed to bind {}", path.display()))?;
                Inner::Unix(listener, path.clone())
            }
            None => {
                let addr = (config.listen_ip, config.listen_port);
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind {}:{}", addr.0, addr.1))?;
                Inner::Tcp(listener)
            }
        };
        Ok(Self { inner, tls })
    }

    pub fn local_addr(&self) -> String {
        match &self.inner {
            Inner::Tcp(listener) => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "-".to_owned()),
            Inner::Unix(_, path) => path.display().to_string(),
        }
    }

    pub async fn accept(&self) -> io::Result<(Accepted, String)> {
        let (stream, peer): (Box<dyn AsyncStream>, String) = match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                (Box::new(stream), peer.to_string())
            }
            Inner::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                (Box::new(stream), path.display().to_string())
            }
        };
        let accepted = match &self.tls {
            Some(acceptor) => Accepted::Tls(acceptor.accept(stream)),
            None => Accepted::Plain(stream),
        };
        Ok((accepted, peer))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Inner::Unix(_, path) = &self.inner {
            if let Err(err) = std::fs::remove_file(path) {
                warn!("Failed to remove socket {}: {}", path.display(), err);
            }
        }
    }
}

fn tls_acceptor(config: &RelayConfig) -> Result<TlsAcceptor> {
    let versions = match config.tls_version()? {
        TlsVersion::Tls13 => TLS13_ONLY,
        TlsVersion::Tls10 | TlsVersion::Tls11 | TlsVersion::Tls12 => TLS12_AND_UP,
    };
    let cert_file = config
        .cert_file
        .as_deref()
        .ok_or_else(|| anyhow!("cert_file is required with tls_support"))?;
    let key_file = config
        .key_file
        .as_deref()
        .ok_or_else(|| anyhow!("key_file is required with tls_support"))?;
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let server_config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_protocol_versions(versions)?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    info!("TLS enabled, minimum version {}", config.tls_min_version);
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("failed to parse private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::config::RelayConfig;

    use super::Listener;

    #[tokio::test]
    async fn should_fail_on_missing_certificate() {
        let config = RelayConfig {
            listen_port: 0,
            tls_support: true,
            cert_file: Some(PathBuf::from("/nonexistent/cert.pem")),
            key_file: Some(PathBuf::from("/nonexistent/key.pem")),
            ..RelayConfig::default()
        };

        assert!(Listener::bind(&config).await.is_err());
    }

    #[tokio::test]
    async fn should_remove_socket_file_on_drop() {
        let path = std::env::temp_dir().join(format!("dnsflow-test-{}.sock", std::process::id()));
        let config = RelayConfig {
            sock_path: Some(path.clone()),
            ..RelayConfig::default()
        };

        let listener = Listener::bind(&config).await.unwrap();
        assert!(path.exists());
        assert_eq!(listener.local_addr(), path.display().to_string());
        drop(listener);

        assert!(!path.exists());
    }
}
