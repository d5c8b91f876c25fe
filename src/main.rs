use anyhow::{Context, Result};
use dnsflow::{
    capture::{platform_source, CaptureWorker},
    config::{CaptureConfig, Config, ConsumerConfig, Validate},
    consumer::LogConsumer,
    metrics,
    relay::{RelayHandle, RelayWorker},
    worker::WorkerHandle,
};
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};

struct Workers {
    consumer: WorkerHandle<ConsumerConfig>,
    relay: Option<RelayHandle>,
    capture: Option<WorkerHandle<CaptureConfig>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config_name = std::env::args()
        .nth(1)
        .context("Config file should be specified as first argument")?;
    let config = Config::from_file(&config_name)?;
    config.validate()?;
    info!("Starting service");
    if let Some(bind_addr) = config.global.metrics_bind_addr {
        tokio::spawn(metrics::serve(bind_addr));
    }
    let workers = start(config).await?;

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = hangup.recv() => reload(&config_name, &workers).await,
        }
    }

    info!("Stopping service");
    if let Some(relay) = workers.relay {
        relay.stop().await;
    }
    if let Some(capture) = workers.capture {
        capture.stop().await;
    }
    workers.consumer.stop().await;
    Ok(())
}

async fn start(config: Config) -> Result<Workers> {
    let (route, consumer) = LogConsumer::start("stdout", config.stdout)?;
    let relay = match config.relay {
        Some(relay) => Some(RelayWorker::start("relay", relay, vec![route.clone()]).await?),
        None => None,
    };
    let capture = match config.capture {
        Some(capture) => Some(CaptureWorker::start(
            "capture",
            capture,
            vec![route.clone()],
            platform_source(),
        )?),
        None => None,
    };
    if relay.is_none() && capture.is_none() {
        warn!("Neither relay nor capture configured, nothing to collect");
    }
    Ok(Workers {
        consumer,
        relay,
        capture,
    })
}

async fn reload(config_name: &str, workers: &Workers) {
    info!("Reloading {}", config_name);
    let config = match Config::from_file(config_name) {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to reload config: {:#}", err);
            return;
        }
    };
    if let Err(err) = workers.consumer.reload(config.stdout).await {
        error!("[stdout] reload rejected: {}", err);
    }
    if let (Some(handle), Some(relay)) = (&workers.relay, config.relay) {
        if let Err(err) = handle.reload(relay).await {
            error!("[relay] reload rejected: {}", err);
        }
    }
    if let (Some(handle), Some(capture)) = (&workers.capture, config.capture) {
        if let Err(err) = handle.reload(capture).await {
            error!("[capture] reload rejected: {}", err);
        }
    }
}
