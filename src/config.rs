use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 4096;
pub const DNSTAP_CONTENT_TYPE: &str = "protobuf:dnstap.Dnstap";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid tls min version {0:?}, expected one of 1.0, 1.1, 1.2, 1.3")]
    InvalidTlsVersion(String),
    #[error("tls support enabled without {0}")]
    MissingTlsFile(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("worker {0} is stopped")]
    WorkerStopped(String),
}

/// Checked at startup, where a failure is fatal, and on every live reload,
/// where a failure keeps the active config in place.
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub relay: Option<RelayConfig>,
    #[serde(default)]
    pub capture: Option<CaptureConfig>,
    #[serde(default)]
    pub stdout: ConsumerConfig,
}

impl Config {
    pub fn from_file(config_name: &str) -> Result<Self> {
        Self::load(config::File::with_name(config_name))
            .with_context(|| format!("failed to load config {}", config_name))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Self::load(config::File::from_str(contents, config::FileFormat::Yaml))
    }

    fn load(source: impl config::Source + Send + Sync + 'static) -> Result<Self> {
        let settings = config::Config::builder().add_source(source).build()?;
        let mut config = settings.try_deserialize::<Self>()?;
        config.apply_global_defaults();
        Ok(config)
    }

    fn apply_global_defaults(&mut self) {
        let size = self.global.channel_buffer_size;
        if let Some(relay) = &mut self.relay {
            relay.channel_buffer_size.get_or_insert(size);
        }
        if let Some(capture) = &mut self.capture {
            capture.channel_buffer_size.get_or_insert(size);
        }
        self.stdout.channel_buffer_size.get_or_insert(size);
    }
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(relay) = &self.relay {
            relay.validate()?;
        }
        if let Some(capture) = &self.capture {
            capture.validate()?;
        }
        self.stdout.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Global {
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    #[serde(default)]
    pub metrics_bind_addr: Option<SocketAddr>,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            metrics_bind_addr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl FromStr for TlsVersion {
    type Err = ConfigError;

    fn from_str(version: &str) -> Result<Self, Self::Err> {
        match version {
            "1.0" => Ok(TlsVersion::Tls10),
            "1.1" => Ok(TlsVersion::Tls11),
            "1.2" => Ok(TlsVersion::Tls12),
            "1.3" => Ok(TlsVersion::Tls13),
            other => Err(ConfigError::InvalidTlsVersion(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub sock_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_support: bool,
    #[serde(default = "default_tls_min_version")]
    pub tls_min_version: String,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub channel_buffer_size: Option<usize>,
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl RelayConfig {
    pub fn buffer_size(&self) -> usize {
        self.channel_buffer_size
            .unwrap_or(DEFAULT_CHANNEL_BUFFER_SIZE)
            .max(1)
    }

    pub fn tls_version(&self) -> Result<TlsVersion, ConfigError> {
        self.tls_min_version.parse()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            listen_port: default_listen_port(),
            sock_path: None,
            tls_support: false,
            tls_min_version: default_tls_min_version(),
            cert_file: None,
            key_file: None,
            channel_buffer_size: None,
            handshake_timeout: default_handshake_timeout(),
            content_type: default_content_type(),
        }
    }
}

impl Validate for RelayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.tls_version()?;
        if self.tls_support {
            if self.cert_file.is_none() {
                return Err(ConfigError::MissingTlsFile("cert_file"));
            }
            if self.key_file.is_none() {
                return Err(ConfigError::MissingTlsFile("key_file"));
            }
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("handshake_timeout"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_port")]
    pub port: u16,
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(with = "humantime_serde", default = "default_flow_timeout")]
    pub flow_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_fragment_timeout")]
    pub fragment_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_report_interval")]
    pub report_interval: Duration,
    #[serde(default)]
    pub channel_buffer_size: Option<usize>,
}

impl CaptureConfig {
    pub fn buffer_size(&self) -> usize {
        self.channel_buffer_size
            .unwrap_or(DEFAULT_CHANNEL_BUFFER_SIZE)
            .max(1)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            port: default_capture_port(),
            identity: default_identity(),
            flow_timeout: default_flow_timeout(),
            fragment_timeout: default_fragment_timeout(),
            report_interval: default_report_interval(),
            channel_buffer_size: None,
        }
    }
}

impl Validate for CaptureConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.flow_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("flow_timeout"));
        }
        if self.fragment_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("fragment_timeout"));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("report_interval"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub channel_buffer_size: Option<usize>,
    #[serde(default)]
    pub transforms: TransformsConfig,
}

impl ConsumerConfig {
    pub fn buffer_size(&self) -> usize {
        self.channel_buffer_size
            .unwrap_or(DEFAULT_CHANNEL_BUFFER_SIZE)
            .max(1)
    }
}

impl Validate for ConsumerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.transforms.reducer.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TransformsConfig {
    #[serde(default)]
    pub reducer: ReducerConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReducerConfig {
    #[serde(default)]
    pub repetitive_traffic_detector: bool,
    #[serde(default)]
    pub qname_plus_one: bool,
    #[serde(with = "humantime_serde", default = "default_watch_interval")]
    pub watch_interval: Duration,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            repetitive_traffic_detector: false,
            qname_plus_one: false,
            watch_interval: default_watch_interval(),
        }
    }
}

impl Validate for ReducerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.watch_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("watch_interval"));
        }
        Ok(())
    }
}

fn default_channel_buffer_size() -> usize {
    DEFAULT_CHANNEL_BUFFER_SIZE
}

fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_listen_port() -> u16 {
    6000
}

fn default_tls_min_version() -> String {
    "1.2".to_owned()
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_content_type() -> String {
    DNSTAP_CONTENT_TYPE.to_owned()
}

fn default_capture_port() -> u16 {
    53
}

fn default_identity() -> String {
    "dnsflow".to_owned()
}

fn default_flow_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_fragment_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_watch_interval() -> Duration {
    Duration::from_secs(5)
}
