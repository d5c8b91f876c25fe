use std::{
    net::SocketAddr,
    sync::Arc,
    time::SystemTime,
};

use anyhow::Result;
use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::future::join_all;
use log::{debug, error, info};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;

pub mod defrag;
pub mod packet;
pub mod source;
pub mod tcp;
pub mod udp;

pub use packet::{LinkType, RawPacket};
pub use source::{platform_source, ChannelSource, PacketSource, UnsupportedSource};

use crate::{
    config::{CaptureConfig, Validate},
    message::{DnsMessage, NetworkInfo, Protocol, CLIENT_QUERY, CLIENT_RESPONSE},
    metrics::{CAPTURED_PACKETS, PIPELINE_ERRORS},
    router::BestEffort,
    worker::{Route, WorkerHandle, WorkerState},
};
use defrag::IpDefragmenter;
use packet::{CapturedPacket, NetworkFlow, Transport, TransportFlow};
use tcp::TcpAssembler;

type SharedConfig = Arc<ArcSwap<CaptureConfig>>;

#[derive(Debug, Clone)]
pub struct DnsPayload {
    pub network: NetworkFlow,
    pub transport: TransportFlow,
    pub protocol: Protocol,
    pub timestamp: SystemTime,
    pub payload: Bytes,
    pub malformed: bool,
}

impl DnsPayload {
    /// Traffic towards `port` is a query; the querier is the other end.
    pub fn into_message(self, port: u16, identity: &str) -> DnsMessage {
        let src = SocketAddr::new(self.network.src, self.transport.src);
        let dst = SocketAddr::new(self.network.dst, self.transport.dst);
        let (operation, query, response) = if self.transport.dst == port {
            (CLIENT_QUERY, src, dst)
        } else {
            (CLIENT_RESPONSE, dst, src)
        };
        let mut dm = DnsMessage::new();
        dm.dnstap.identity = identity.to_owned();
        dm.dnstap.operation = operation.to_owned();
        dm.dnstap.timestamp = self.timestamp;
        dm.network = NetworkInfo {
            protocol: Some(self.protocol),
            query: Some(query),
            response: Some(response),
        };
        dm.dns.payload = self.payload;
        dm.decode_payload();
        if self.malformed {
            dm.dns.malformed = true;
        }
        dm
    }
}

pub struct CaptureWorker;

impl CaptureWorker {
    pub fn start(
        name: &str,
        config: CaptureConfig,
        routes: Vec<Route>,
        source: Box<dyn PacketSource>,
    ) -> Result<WorkerHandle<CaptureConfig>> {
        config.validate()?;
        info!(
            "[{}] capturing dns traffic on port {} from {} source",
            name,
            config.port,
            source.name()
        );
        Ok(WorkerHandle::spawn(name, config, routes, move |state| {
            control_loop(state, source)
        }))
    }
}

async fn control_loop(mut state: WorkerState<CaptureConfig>, mut source: Box<dyn PacketSource>) {
    let name = state.name().to_owned();
    let config = state.shared_config();
    let buffer_size = config.load().buffer_size();
    let stop = state.stop_token();
    let source_stop = CancellationToken::new();
    let (raw_tx, raw_rx) = mpsc::channel(buffer_size);
    let (udp_tx, udp_rx) = mpsc::channel(buffer_size);
    let (tcp_tx, tcp_rx) = mpsc::channel(buffer_size);
    let (dns_tx, mut dns_rx) = mpsc::channel(buffer_size);

    let source_task = {
        let stop = source_stop.clone();
        let name = name.clone();
        tokio::spawn(async move {
            if let Err(err) = source.run(raw_tx, stop).await {
                error!("[{}] {} packet source failed: {:#}", name, source.name(), err);
            }
        })
    };
    let stages = vec![
        source_task,
        tokio::spawn(defrag_stage(raw_rx, udp_tx, tcp_tx, config.clone())),
        tokio::spawn(udp_stage(udp_rx, dns_tx.clone(), config.clone())),
        tokio::spawn(tcp_stage(tcp_rx, dns_tx, config.clone())),
    ];

    let mut best_effort = BestEffort::new(&name);
    let mut report = time::interval(config.load().report_interval);
    let mut running = true;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(update) = state.next_config() => {
                state.apply_config(update);
            }
            dm = dns_rx.recv(), if running => match dm {
                Some(dm) => best_effort.deliver(&state.routes(), dm),
                None => {
                    info!("[{}] capture pipeline ended", name);
                    running = false;
                }
            },
            _ = report.tick() => {
                best_effort.report();
            }
        }
    }

    source_stop.cancel();
    while let Some(dm) = dns_rx.recv().await {
        best_effort.deliver(&state.routes(), dm);
    }
    for result in join_all(stages).await {
        if let Err(err) = result {
            error!("[{}] pipeline stage failed: {}", name, err);
        }
    }
    best_effort.report();
}

async fn defrag_stage(
    mut input: mpsc::Receiver<RawPacket>,
    udp: mpsc::Sender<CapturedPacket>,
    tcp: mpsc::Sender<CapturedPacket>,
    config: SharedConfig,
) {
    let mut defragmenter = IpDefragmenter::new();
    let packets = CAPTURED_PACKETS.with_label_values(&["defrag"]);
    let errors = PIPELINE_ERRORS.with_label_values(&["defrag"]);
    let mut cleanup = time::interval(config.load().fragment_timeout);
    loop {
        let raw = tokio::select! {
            raw = input.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
            _ = cleanup.tick() => {
                let discarded = defragmenter.discard_older_than(config.load().fragment_timeout);
                if discarded > 0 {
                    debug!("discarded {} incomplete fragment group(s)", discarded);
                }
                continue;
            }
        };
        packets.inc();
        let captured = raw
            .parse_ip()
            .and_then(|ip| defragmenter.defrag(ip))
            .and_then(|ip| ip.map(|ip| ip.parse_transport()).transpose())
            .map(Option::flatten);
        let packet = match captured {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(err) => {
                errors.inc();
                debug!("dropping packet: {}", err);
                continue;
            }
        };
        let branch = match packet.kind {
            Transport::Udp => &udp,
            Transport::Tcp(_) => &tcp,
        };
        if branch.send(packet).await.is_err() {
            break;
        }
    }
}

async fn udp_stage(
    mut input: mpsc::Receiver<CapturedPacket>,
    output: mpsc::Sender<DnsMessage>,
    config: SharedConfig,
) {
    let packets = CAPTURED_PACKETS.with_label_values(&["udp"]);
    while let Some(packet) = input.recv().await {
        packets.inc();
        let port = config.load().port;
        if let Some(payload) = udp::process_datagram(packet, port) {
            if !emit(&output, vec![payload], &config).await {
                break;
            }
        }
    }
}

async fn tcp_stage(
    mut input: mpsc::Receiver<CapturedPacket>,
    output: mpsc::Sender<DnsMessage>,
    config: SharedConfig,
) {
    let mut assembler = TcpAssembler::new();
    let packets = CAPTURED_PACKETS.with_label_values(&["tcp"]);
    let mut eviction = time::interval(config.load().flow_timeout);
    loop {
        let payloads = tokio::select! {
            packet = input.recv() => match packet {
                Some(packet) => {
                    if !packet.transport.matches_port(config.load().port) {
                        continue;
                    }
                    packets.inc();
                    assembler.assemble(packet)
                }
                None => break,
            },
            _ = eviction.tick() => assembler.evict_idle(config.load().flow_timeout),
        };
        if !emit(&output, payloads, &config).await {
            return;
        }
    }
    if assembler.flows() > 0 {
        info!("flushing {} open tcp flow(s)", assembler.flows());
    }
    emit(&output, assembler.flush_all(), &config).await;
}

async fn emit(
    output: &mpsc::Sender<DnsMessage>,
    payloads: Vec<DnsPayload>,
    config: &SharedConfig,
) -> bool {
    if payloads.is_empty() {
        return true;
    }
    let config = config.load_full();
    for payload in payloads {
        let dm = payload.into_message(config.port, &config.identity);
        if output.send(dm).await.is_err() {
            return false;
        }
    }
    true
}
