use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;

use super::packet::RawPacket;
use crate::{metrics::CAPTURED_PACKETS, router::BestEffort};

/// A capture backend. `run` pushes frames into `output` until `stop` fires
/// or the backend runs dry, and must never block on a full `output`.
#[async_trait]
pub trait PacketSource: Send {
    fn name(&self) -> &'static str;

    async fn run(&mut self, output: mpsc::Sender<RawPacket>, stop: CancellationToken) -> Result<()>;
}

const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

pub struct ChannelSource {
    input: mpsc::Receiver<RawPacket>,
    report_interval: Duration,
    reported_drops: u64,
}

impl ChannelSource {
    pub fn new(buffer_size: usize) -> (mpsc::Sender<RawPacket>, Self) {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        let source = Self {
            input: rx,
            report_interval: DEFAULT_REPORT_INTERVAL,
            reported_drops: 0,
        };
        (tx, source)
    }

    pub fn with_report_interval(mut self, report_interval: Duration) -> Self {
        self.report_interval = report_interval.max(Duration::from_millis(1));
        self
    }

    pub fn reported_drops(&self) -> u64 {
        self.reported_drops
    }
}

#[async_trait]
impl PacketSource for ChannelSource {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn run(
        &mut self,
        output: mpsc::Sender<RawPacket>,
        stop: CancellationToken,
    ) -> Result<()> {
        let mut drops = BestEffort::new("source");
        let mut report = time::interval_at(
            time::Instant::now() + self.report_interval,
            self.report_interval,
        );
        let mut open = true;
        while open {
            let packet = tokio::select! {
                _ = stop.cancelled() => break,
                _ = report.tick() => {
                    self.reported_drops += drops.report();
                    continue;
                }
                packet = self.input.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            open = forward(&mut drops, &output, packet);
        }
        while open {
            match self.input.try_recv() {
                Ok(packet) => open = forward(&mut drops, &output, packet),
                Err(_) => break,
            }
        }
        self.reported_drops += drops.report();
        Ok(())
    }
}

fn forward(drops: &mut BestEffort, output: &mpsc::Sender<RawPacket>, packet: RawPacket) -> bool {
    CAPTURED_PACKETS.with_label_values(&["source"]).inc();
    drops.offer(output, packet)
}

pub struct UnsupportedSource;

#[async_trait]
impl PacketSource for UnsupportedSource {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn run(
        &mut self,
        _output: mpsc::Sender<RawPacket>,
        _stop: CancellationToken,
    ) -> Result<()> {
        warn!(
            "no packet capture backend available on {}",
            std::env::consts::OS
        );
        Ok(())
    }
}

pub fn platform_source() -> Box<dyn PacketSource> {
    info!("selecting packet source for {}", std::env::consts::OS);
    Box::new(UnsupportedSource)
}
