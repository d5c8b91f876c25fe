use std::{
    fmt,
    net::SocketAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use log::debug;

use crate::dns::{self, MessageType};

pub const CLIENT_QUERY: &str = "CLIENT_QUERY";
pub const CLIENT_RESPONSE: &str = "CLIENT_RESPONSE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => f.write_str("UDP"),
            Protocol::Tcp => f.write_str("TCP"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkInfo {
    pub protocol: Option<Protocol>,
    pub query: Option<SocketAddr>,
    pub response: Option<SocketAddr>,
}

impl NetworkInfo {
    pub fn family(&self) -> &'static str {
        match self.query.or(self.response) {
            Some(SocketAddr::V4(_)) => "INET",
            Some(SocketAddr::V6(_)) => "INET6",
            None => "-",
        }
    }

    pub fn query_ip(&self) -> String {
        self.query
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "-".to_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DnsInfo {
    pub id: u16,
    pub qname: String,
    pub qtype: String,
    pub rcode: String,
    pub length: usize,
    pub payload: Bytes,
    pub malformed: bool,
}

impl Default for DnsInfo {
    fn default() -> Self {
        Self {
            id: 0,
            qname: "-".to_owned(),
            qtype: "-".to_owned(),
            rcode: "-".to_owned(),
            length: 0,
            payload: Bytes::new(),
            malformed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DnstapInfo {
    pub identity: String,
    pub operation: String,
    pub timestamp: SystemTime,
    pub content_type: Option<Bytes>,
    pub payload: Option<Bytes>,
}

impl Default for DnstapInfo {
    fn default() -> Self {
        Self {
            identity: "-".to_owned(),
            operation: "-".to_owned(),
            timestamp: UNIX_EPOCH,
            content_type: None,
            payload: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReducerInfo {
    pub occurrences: u64,
    pub cumulative_length: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DnsMessage {
    pub network: NetworkInfo,
    pub dns: DnsInfo,
    pub dnstap: DnstapInfo,
    pub reducer: Option<ReducerInfo>,
}

impl DnsMessage {
    pub fn new() -> Self {
        let mut dm = Self::default();
        dm.dnstap.timestamp = SystemTime::now();
        dm
    }

    pub fn from_frame(payload: Bytes, content_type: Bytes) -> Self {
        let mut dm = Self::new();
        dm.dnstap.content_type = Some(content_type);
        dm.dnstap.payload = Some(payload);
        dm
    }

    pub fn decode_payload(&mut self) {
        let payload = self.dns.payload.clone();
        self.dns.length = payload.len();
        match dns::parse_summary(&payload) {
            Ok(summary) => {
                self.dns.id = summary.header.id;
                self.dns.rcode = dns::rcode_name(summary.header.flags.rcode);
                if let Some(question) = summary.question {
                    self.dns.qname = question.qname();
                    self.dns.qtype = dns::qtype_name(question.type_);
                }
                if self.dnstap.operation == "-" {
                    self.dnstap.operation = match summary.header.flags.message_type {
                        MessageType::Query => CLIENT_QUERY.to_owned(),
                        MessageType::Response => CLIENT_RESPONSE.to_owned(),
                    };
                }
            }
            Err(err) => {
                debug!("unable to decode dns payload: {:#}", err);
                self.dns.malformed = true;
            }
        }
    }
}

impl fmt::Display for DnsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = self
            .network
            .protocol
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_owned());
        write!(
            f,
            "{} {} {} {} {} {} {}b {} {} {}",
            humantime::format_rfc3339_nanos(self.dnstap.timestamp),
            self.dnstap.identity,
            self.dnstap.operation,
            self.network.query_ip(),
            protocol,
            self.network.family(),
            self.dns.length,
            self.dns.qname,
            self.dns.qtype,
            self.dns.rcode,
        )?;
        if self.dns.malformed {
            f.write_str(" malformed")?;
        }
        if let Some(reducer) = &self.reducer {
            write!(
                f,
                " occurrences={} cumulative_length={}",
                reducer.occurrences, reducer.cumulative_length
            )?;
        }
        Ok(())
    }
}
