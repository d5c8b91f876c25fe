use std::{sync::Arc, time::Duration};

use anyhow::Result;
use log::{error, info, warn};
use tokio::time;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

mod connection;
mod listener;

pub use connection::ConnectionError;

use crate::{
    config::{ConfigError, RelayConfig, Validate},
    worker::{Route, WorkerHandle, WorkerState},
};
use connection::Connection;
use listener::Listener;

pub struct RelayWorker;

impl RelayWorker {
    pub async fn start(name: &str, config: RelayConfig, routes: Vec<Route>) -> Result<RelayHandle> {
        config.validate()?;
        let listener = Listener::bind(&config).await?;
        let local_addr = listener.local_addr();
        info!("[{}] listening on {}", name, local_addr);
        let tracker = TaskTracker::new();
        let connections = tracker.clone();
        let worker = WorkerHandle::spawn(name, config, routes, move |state| {
            control_loop(state, listener, connections)
        });
        Ok(RelayHandle {
            worker,
            local_addr,
            tracker,
        })
    }
}

pub struct RelayHandle {
    worker: WorkerHandle<RelayConfig>,
    local_addr: String,
    tracker: TaskTracker,
}

impl RelayHandle {
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    pub fn config(&self) -> Arc<RelayConfig> {
        self.worker.config()
    }

    pub async fn reload(&self, config: RelayConfig) -> Result<(), ConfigError> {
        self.worker.reload(config).await
    }

    pub fn set_routes(&self, routes: Vec<Route>) {
        self.worker.set_routes(routes)
    }

    pub async fn stop(self) {
        self.worker.stop().await
    }
}

async fn control_loop(
    mut state: WorkerState<RelayConfig>,
    listener: Listener,
    connections: TaskTracker,
) {
    let name: Arc<str> = Arc::from(state.name());
    let stop = state.stop_token();
    let force_close = CancellationToken::new();
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(update) = state.next_config() => {
                let previous = state.config();
                if state.apply_config(update) && listener_changed(&previous, &state.config()) {
                    warn!("[{}] listener settings changed, restart required to rebind", name);
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((accepted, peer)) => {
                    next_id += 1;
                    let conn = Connection {
                        id: next_id,
                        peer,
                        worker: name.clone(),
                        config: state.config(),
                        routes: state.routes(),
                        force_close: force_close.clone(),
                    };
                    connections.spawn(connection::handle_conn(conn, accepted));
                }
                Err(err) => {
                    error!("[{}] accept failed: {}", name, err);
                    time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    drop(listener);
    info!(
        "[{}] listener closed, closing {} connection(s)",
        name,
        connections.len()
    );
    force_close.cancel();
    connections.close();
    connections.wait().await;
}

fn listener_changed(previous: &RelayConfig, current: &RelayConfig) -> bool {
    previous.listen_ip != current.listen_ip
        || previous.listen_port != current.listen_port
        || previous.sock_path != current.sock_path
        || previous.tls_support != current.tls_support
        || previous.tls_min_version != current.tls_min_version
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::Arc,
        time::Duration,
    };

    use anyhow::Result;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use rustls::{pki_types::ServerName, ClientConfig, RootCertStore, SupportedProtocolVersion};
    use tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        net::TcpStream,
        sync::mpsc,
    };
    use tokio_rustls::TlsConnector;

    use super::{RelayHandle, RelayWorker};
    use crate::{
        config::{ConfigError, RelayConfig, DNSTAP_CONTENT_TYPE},
        framestream::FrameStream,
        message::DnsMessage,
    };

    fn loopback() -> RelayConfig {
        RelayConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_port: 0,
            ..RelayConfig::default()
        }
    }

    async fn connect(handle: &RelayHandle) -> Result<FrameStream<TcpStream>> {
        let stream = TcpStream::connect(handle.local_addr()).await?;
        let mut frames = FrameStream::new(
            stream,
            DNSTAP_CONTENT_TYPE.as_bytes().to_vec(),
            Duration::from_secs(5),
            true,
        );
        frames.init_sender().await?;
        Ok(frames)
    }

    fn tls_config(min_version: &str, tag: &str) -> Result<(RelayConfig, String)> {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])?;
        let cert_pem = certified.cert.pem();
        let dir = std::env::temp_dir().join(format!("dnsflow-tls-{}-{}", std::process::id(), tag));
        std::fs::create_dir_all(&dir)?;
        let cert_file = dir.join("cert.pem");
        let key_file = dir.join("key.pem");
        std::fs::write(&cert_file, &cert_pem)?;
        std::fs::write(&key_file, certified.key_pair.serialize_pem())?;
        let config = RelayConfig {
            tls_support: true,
            tls_min_version: min_version.to_owned(),
            cert_file: Some(cert_file),
            key_file: Some(key_file),
            ..loopback()
        };
        Ok((config, cert_pem))
    }

    fn tls_connector(
        cert_pem: &str,
        versions: &[&'static SupportedProtocolVersion],
    ) -> Result<TlsConnector> {
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut cert_pem.as_bytes()) {
            roots.add(cert?)?;
        }
        let config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_protocol_versions(versions)?
                .with_root_certificates(roots)
                .with_no_client_auth();
        Ok(TlsConnector::from(Arc::new(config)))
    }

    async fn send_over<S>(stream: S, payload: &'static [u8]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = FrameStream::new(
            stream,
            DNSTAP_CONTENT_TYPE.as_bytes().to_vec(),
            Duration::from_secs(5),
            true,
        );
        client.init_sender().await?;
        client.send_frame(payload).await?;
        client.finish().await?;
        Ok(())
    }

    async fn receive(rx: &mut mpsc::Receiver<DnsMessage>, count: usize) -> Vec<Bytes> {
        let mut payloads = Vec::new();
        for _ in 0..count {
            let dm = rx.recv().await.unwrap();
            payloads.push(dm.dnstap.payload.unwrap());
        }
        payloads
    }

    #[tokio::test]
    async fn should_emit_one_message_per_frame() -> Result<()> {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = RelayWorker::start("relay", loopback(), vec![tx]).await?;
        let payloads: Vec<Bytes> = (0..20u8)
            .map(|i| Bytes::from(vec![i; 10 + i as usize]))
            .collect();

        let mut client = connect(&handle).await?;
        for payload in &payloads {
            client.send_frame(payload).await?;
        }
        client.finish().await?;

        assert_eq!(receive(&mut rx, payloads.len()).await, payloads);
        handle.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn should_relay_frames_over_tls() -> Result<()> {
        let (config, cert_pem) = tls_config("1.2", "relay")?;
        let (tx, mut rx) = mpsc::channel(8);
        let handle = RelayWorker::start("relay", config, vec![tx]).await?;
        let connector = tls_connector(&cert_pem, &[&rustls::version::TLS12])?;

        let stream = TcpStream::connect(handle.local_addr()).await?;
        let stream = connector
            .connect(ServerName::try_from("localhost")?, stream)
            .await?;
        send_over(stream, b"secured").await?;

        assert_eq!(receive(&mut rx, 1).await, vec![Bytes::from_static(b"secured")]);
        handle.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn should_refuse_tls12_client_when_tls13_is_required() -> Result<()> {
        let (config, cert_pem) = tls_config("1.3", "strict")?;
        let (tx, mut rx) = mpsc::channel(8);
        let handle = RelayWorker::start("relay", config, vec![tx]).await?;

        let legacy = tls_connector(&cert_pem, &[&rustls::version::TLS12])?;
        let stream = TcpStream::connect(handle.local_addr()).await?;
        let refused = legacy
            .connect(ServerName::try_from("localhost")?, stream)
            .await;
        assert!(refused.is_err());

        let modern = tls_connector(&cert_pem, &[&rustls::version::TLS13])?;
        let stream = TcpStream::connect(handle.local_addr()).await?;
        let stream = modern
            .connect(ServerName::try_from("localhost")?, stream)
            .await?;
        send_over(stream, b"tls13").await?;

        assert_eq!(receive(&mut rx, 1).await, vec![Bytes::from_static(b"tls13")]);
        handle.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn should_drop_client_stalling_tls_handshake() -> Result<()> {
        let (config, _) = tls_config("1.2", "stall")?;
        let config = RelayConfig {
            handshake_timeout: Duration::from_millis(100),
            ..config
        };
        let handle = RelayWorker::start("relay", config, Vec::new()).await?;

        let mut silent = TcpStream::connect(handle.local_addr()).await?;
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), silent.read(&mut buf)).await?;

        assert!(matches!(read, Ok(0) | Err(_)), "{:?}", read);
        handle.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn should_close_every_connection_on_stop() -> Result<()> {
        let (tx, _rx) = mpsc::channel(64);
        let handle = RelayWorker::start("relay", loopback(), vec![tx]).await?;
        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(connect(&handle).await?);
        }
        assert_eq!(handle.active_connections(), 3);
        let tracker = handle.tracker.clone();

        handle.stop().await;

        assert_eq!(tracker.len(), 0);
        for client in clients {
            let mut stream = client.into_inner();
            let mut buf = [0u8; 16];
            let read = stream.read(&mut buf).await;
            assert!(matches!(read, Ok(0) | Err(_)), "{:?}", read);
        }
        Ok(())
    }

    #[tokio::test]
    async fn should_refuse_to_start_with_invalid_tls_version() {
        let path = std::env::temp_dir().join(format!("dnsflow-relay-{}.sock", std::process::id()));
        let config = RelayConfig {
            sock_path: Some(path.clone()),
            tls_min_version: "1.4".to_owned(),
            ..RelayConfig::default()
        };

        let err = RelayWorker::start("relay", config, Vec::new())
            .await
            .err()
            .unwrap();

        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::InvalidTlsVersion("1.4".to_owned()))
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn should_keep_serving_after_invalid_reload() -> Result<()> {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = RelayWorker::start("relay", loopback(), vec![tx]).await?;
        let mut client = connect(&handle).await?;

        let invalid = RelayConfig {
            tls_min_version: "2.0".to_owned(),
            ..loopback()
        };
        assert_eq!(
            handle.reload(invalid).await,
            Err(ConfigError::InvalidTlsVersion("2.0".to_owned()))
        );
        assert_eq!(handle.config().tls_min_version, "1.2");

        client.send_frame(b"before").await?;
        let mut late = connect(&handle).await?;
        late.send_frame(b"after").await?;
        let mut received = receive(&mut rx, 2).await;
        received.sort();
        assert_eq!(received, vec![Bytes::from_static(b"after"), Bytes::from_static(b"before")]);
        handle.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn should_isolate_malformed_connection() -> Result<()> {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = RelayWorker::start("relay", loopback(), vec![tx]).await?;
        let mut healthy = connect(&handle).await?;

        let mut broken = TcpStream::connect(handle.local_addr()).await?;
        broken.write_all(&[0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 9]).await?;
        let mut buf = [0u8; 16];
        let read = broken.read(&mut buf).await;
        assert!(matches!(read, Ok(0) | Err(_)), "{:?}", read);

        healthy.send_frame(b"still alive").await?;
        assert_eq!(receive(&mut rx, 1).await, vec![Bytes::from_static(b"still alive")]);
        assert_eq!(handle.active_connections(), 1);
        handle.stop().await;
        Ok(())
    }
}
