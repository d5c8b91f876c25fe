use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::SystemTime,
};

use bytes::Bytes;
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32, be_u8},
    IResult,
};
use thiserror::Error;

use crate::message::Protocol;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_DESTINATION: u8 = 60;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("truncated {0} header")]
    Truncated(&'static str),
    #[error("unsupported ethertype {0:#06x}")]
    EtherType(u16),
    #[error("unsupported ip version {0}")]
    IpVersion(u8),
    #[error("overlapping fragment in group {0:#x}")]
    Overlap(u32),
    #[error("reassembled datagram exceeds {0} bytes")]
    TooLarge(usize),
    #[error("too many pending fragment groups ({0})")]
    TooManyGroups(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    Raw,
}

#[derive(Debug, Clone)]
pub struct RawPacket {
    pub link: LinkType,
    pub timestamp: SystemTime,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkFlow {
    pub src: IpAddr,
    pub dst: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportFlow {
    pub src: u16,
    pub dst: u16,
}

impl TransportFlow {
    pub fn matches_port(&self, port: u16) -> bool {
        self.src == port || self.dst == port
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub id: u32,
    pub offset: usize,
    pub more: bool,
}

#[derive(Debug, Clone)]
pub struct IpPacket {
    pub network: NetworkFlow,
    pub protocol: u8,
    pub fragment: Option<Fragment>,
    pub timestamp: SystemTime,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp(TcpHeader),
}

#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub network: NetworkFlow,
    pub transport: TransportFlow,
    pub kind: Transport,
    pub timestamp: SystemTime,
    pub payload: Bytes,
}

impl CapturedPacket {
    pub fn protocol(&self) -> Protocol {
        match self.kind {
            Transport::Udp => Protocol::Udp,
            Transport::Tcp(_) => Protocol::Tcp,
        }
    }
}

impl RawPacket {
    pub fn parse_ip(&self) -> Result<IpPacket, PacketError> {
        let offset = match self.link {
            LinkType::Raw => 0,
            LinkType::Ethernet => {
                let (rest, ethertype) = ethernet_header(&self.data)
                    .map_err(|_| PacketError::Truncated("ethernet"))?;
                if ethertype != ETHERTYPE_IPV4 && ethertype != ETHERTYPE_IPV6 {
                    return Err(PacketError::EtherType(ethertype));
                }
                self.data.len() - rest.len()
            }
        };
        let ip = self.data.slice(offset..);
        match ip.first().map(|b| b >> 4) {
            Some(4) => parse_ipv4(ip, self.timestamp),
            Some(6) => parse_ipv6(ip, self.timestamp),
            Some(version) => Err(PacketError::IpVersion(version)),
            None => Err(PacketError::Truncated("ip")),
        }
    }
}

impl IpPacket {
    pub fn parse_transport(self) -> Result<Option<CapturedPacket>, PacketError> {
        let data = &self.payload;
        let (transport, kind, header_len, end) = match self.protocol {
            IPPROTO_UDP => {
                let (_, (src, dst, length)) =
                    udp_header(data).map_err(|_| PacketError::Truncated("udp"))?;
                let end = (length as usize).clamp(8, data.len());
                (TransportFlow { src, dst }, Transport::Udp, 8, end)
            }
            IPPROTO_TCP => {
                let (_, (src, dst, seq, data_offset, flags)) =
                    tcp_header(data).map_err(|_| PacketError::Truncated("tcp"))?;
                if data_offset < 20 || data_offset > data.len() {
                    return Err(PacketError::Truncated("tcp"));
                }
                let header = TcpHeader {
                    seq,
                    syn: flags & TCP_SYN != 0,
                    fin: flags & TCP_FIN != 0,
                    rst: flags & TCP_RST != 0,
                };
                let flow = TransportFlow { src, dst };
                (flow, Transport::Tcp(header), data_offset, data.len())
            }
            _ => return Ok(None),
        };
        Ok(Some(CapturedPacket {
            network: self.network,
            transport,
            kind,
            timestamp: self.timestamp,
            payload: self.payload.slice(header_len..end),
        }))
    }
}

fn parse_ipv4(data: Bytes, timestamp: SystemTime) -> Result<IpPacket, PacketError> {
    let (_, header) = ipv4_header(&data).map_err(|_| PacketError::Truncated("ipv4"))?;
    let end = header.total_length.min(data.len());
    if header.ihl < 20 || header.ihl > end {
        return Err(PacketError::Truncated("ipv4"));
    }
    let more = header.flags_fragment & 0x2000 != 0;
    let offset = (header.flags_fragment & 0x1fff) as usize * 8;
    let fragment = (more || offset > 0).then_some(Fragment {
        id: header.id as u32,
        offset,
        more,
    });
    Ok(IpPacket {
        network: NetworkFlow {
            src: IpAddr::V4(header.src),
            dst: IpAddr::V4(header.dst),
        },
        protocol: header.protocol,
        fragment,
        timestamp,
        payload: data.slice(header.ihl..end),
    })
}

fn parse_ipv6(data: Bytes, timestamp: SystemTime) -> Result<IpPacket, PacketError> {
    let (_, (payload_length, mut next, src, dst)) =
        ipv6_header(&data).map_err(|_| PacketError::Truncated("ipv6"))?;
    let end = match payload_length {
        0 => data.len(),
        length => (40 + length as usize).min(data.len()),
    };
    let mut offset = 40;
    let mut fragment = None;
    loop {
        if offset > end {
            return Err(PacketError::Truncated("ipv6 extension"));
        }
        match next {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DESTINATION => {
                let (_, (next_header, length)) = ipv6_extension(&data[offset..end])
                    .map_err(|_| PacketError::Truncated("ipv6 extension"))?;
                next = next_header;
                offset += (length as usize + 1) * 8;
            }
            IPV6_FRAGMENT => {
                let (_, (next_header, field, id)) = ipv6_fragment(&data[offset..end])
                    .map_err(|_| PacketError::Truncated("ipv6 fragment"))?;
                next = next_header;
                offset += 8;
                fragment = Some(Fragment {
                    id,
                    offset: (field >> 3) as usize * 8,
                    more: field & 0x1 != 0,
                });
            }
            _ => break,
        }
    }
    if offset > end {
        return Err(PacketError::Truncated("ipv6 extension"));
    }
    // an atomic fragment carries the whole datagram
    let fragment = fragment.filter(|f| f.more || f.offset > 0);
    Ok(IpPacket {
        network: NetworkFlow {
            src: IpAddr::V6(src),
            dst: IpAddr::V6(dst),
        },
        protocol: next,
        fragment,
        timestamp,
        payload: data.slice(offset..end),
    })
}

fn ethernet_header(input: &[u8]) -> IResult<&[u8], u16> {
    let (input, _addresses) = take(12usize)(input)?;
    let (input, ethertype) = be_u16(input)?;
    if ethertype == ETHERTYPE_VLAN {
        let (input, _tci) = be_u16(input)?;
        be_u16(input)
    } else {
        Ok((input, ethertype))
    }
}

struct Ipv4Header {
    ihl: usize,
    total_length: usize,
    id: u16,
    flags_fragment: u16,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

fn ipv4_header(input: &[u8]) -> IResult<&[u8], Ipv4Header> {
    let (input, version_ihl) = be_u8(input)?;
    let (input, _tos) = be_u8(input)?;
    let (input, total_length) = be_u16(input)?;
    let (input, id) = be_u16(input)?;
    let (input, flags_fragment) = be_u16(input)?;
    let (input, _ttl) = be_u8(input)?;
    let (input, protocol) = be_u8(input)?;
    let (input, _checksum) = be_u16(input)?;
    let (input, src) = be_u32(input)?;
    let (input, dst) = be_u32(input)?;
    Ok((
        input,
        Ipv4Header {
            ihl: (version_ihl & 0x0f) as usize * 4,
            total_length: total_length as usize,
            id,
            flags_fragment,
            protocol,
            src: Ipv4Addr::from(src),
            dst: Ipv4Addr::from(dst),
        },
    ))
}

fn ipv6_address(input: &[u8]) -> IResult<&[u8], Ipv6Addr> {
    let (input, octets) = take(16usize)(input)?;
    let mut address = [0u8; 16];
    address.copy_from_slice(octets);
    Ok((input, Ipv6Addr::from(address)))
}

fn ipv6_header(input: &[u8]) -> IResult<&[u8], (u16, u8, Ipv6Addr, Ipv6Addr)> {
    let (input, _version_class_label) = be_u32(input)?;
    let (input, payload_length) = be_u16(input)?;
    let (input, next_header) = be_u8(input)?;
    let (input, _hop_limit) = be_u8(input)?;
    let (input, src) = ipv6_address(input)?;
    let (input, dst) = ipv6_address(input)?;
    Ok((input, (payload_length, next_header, src, dst)))
}

fn ipv6_extension(input: &[u8]) -> IResult<&[u8], (u8, u8)> {
    let (input, next_header) = be_u8(input)?;
    let (input, length) = be_u8(input)?;
    Ok((input, (next_header, length)))
}

fn ipv6_fragment(input: &[u8]) -> IResult<&[u8], (u8, u16, u32)> {
    let (input, next_header) = be_u8(input)?;
    let (input, _reserved) = be_u8(input)?;
    let (input, field) = be_u16(input)?;
    let (input, id) = be_u32(input)?;
    Ok((input, (next_header, field, id)))
}

fn udp_header(input: &[u8]) -> IResult<&[u8], (u16, u16, u16)> {
    let (input, src) = be_u16(input)?;
    let (input, dst) = be_u16(input)?;
    let (input, length) = be_u16(input)?;
    let (input, _checksum) = be_u16(input)?;
    Ok((input, (src, dst, length)))
}

fn tcp_header(input: &[u8]) -> IResult<&[u8], (u16, u16, u32, usize, u8)> {
    let (input, src) = be_u16(input)?;
    let (input, dst) = be_u16(input)?;
    let (input, seq) = be_u32(input)?;
    let (input, _ack) = be_u32(input)?;
    let (input, offset_reserved) = be_u8(input)?;
    let (input, flags) = be_u8(input)?;
    let (input, _window) = be_u16(input)?;
    let (input, _checksum) = be_u16(input)?;
    let (input, _urgent) = be_u16(input)?;
    Ok((
        input,
        (src, dst, seq, (offset_reserved >> 4) as usize * 4, flags),
    ))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        net::{Ipv4Addr, Ipv6Addr},
        time::SystemTime,
    };

    use bytes::Bytes;

    use super::{LinkType, RawPacket, IPPROTO_TCP, IPPROTO_UDP, TCP_FIN, TCP_SYN};

    pub const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    pub const RESOLVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    pub fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut segment = Vec::new();
        segment.extend_from_slice(&src_port.to_be_bytes());
        segment.extend_from_slice(&dst_port.to_be_bytes());
        segment.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        segment.extend_from_slice(&[0, 0]);
        segment.extend_from_slice(payload);
        segment
    }

    pub fn tcp(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        syn: bool,
        fin: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut flags = 0x10;
        if syn {
            flags |= TCP_SYN;
        }
        if fin {
            flags |= TCP_FIN;
        }
        let mut segment = Vec::new();
        segment.extend_from_slice(&src_port.to_be_bytes());
        segment.extend_from_slice(&dst_port.to_be_bytes());
        segment.extend_from_slice(&seq.to_be_bytes());
        segment.extend_from_slice(&[0, 0, 0, 0]);
        segment.push(5 << 4);
        segment.push(flags);
        segment.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);
        segment.extend_from_slice(payload);
        segment
    }

    pub fn ipv4(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        id: u16,
        fragment: (usize, bool),
        payload: &[u8],
    ) -> Vec<u8> {
        let mut flags_fragment = (fragment.0 / 8) as u16;
        if fragment.1 {
            flags_fragment |= 0x2000;
        }
        let mut packet = vec![0x45, 0];
        packet.extend_from_slice(&((20 + payload.len()) as u16).to_be_bytes());
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(&flags_fragment.to_be_bytes());
        packet.extend_from_slice(&[64, protocol, 0, 0]);
        packet.extend_from_slice(&src.octets());
        packet.extend_from_slice(&dst.octets());
        packet.extend_from_slice(payload);
        packet
    }

    pub fn ipv6_fragment(
        src: Ipv6Addr,
        dst: Ipv6Addr,
        protocol: u8,
        id: u32,
        fragment: (usize, bool),
        payload: &[u8],
    ) -> Vec<u8> {
        let mut packet = vec![0x60, 0, 0, 0];
        packet.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        packet.extend_from_slice(&[44, 64]);
        packet.extend_from_slice(&src.octets());
        packet.extend_from_slice(&dst.octets());
        let field = ((fragment.0 / 8) as u16) << 3 | fragment.1 as u16;
        packet.extend_from_slice(&[protocol, 0]);
        packet.extend_from_slice(&field.to_be_bytes());
        packet.extend_from_slice(&id.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    pub fn ethernet(ip: &[u8], vlan: bool) -> Vec<u8> {
        let mut frame = vec![0u8; 12];
        if vlan {
            frame.extend_from_slice(&[0x81, 0x00, 0x00, 0x64]);
        }
        let ethertype: u16 = if ip[0] >> 4 == 6 { 0x86dd } else { 0x0800 };
        frame.extend_from_slice(&ethertype.to_be_bytes());
        frame.extend_from_slice(ip);
        frame
    }

    pub fn raw(data: Vec<u8>) -> RawPacket {
        RawPacket {
            link: LinkType::Raw,
            timestamp: SystemTime::now(),
            data: Bytes::from(data),
        }
    }

    pub fn udp_query(src_port: u16, dst_port: u16, payload: &[u8]) -> RawPacket {
        raw(ipv4(CLIENT, RESOLVER, IPPROTO_UDP, 1, (0, false), &udp(src_port, dst_port, payload)))
    }

    pub fn tcp_segment(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        syn: bool,
        fin: bool,
        payload: &[u8],
    ) -> RawPacket {
        raw(ipv4(
            CLIENT,
            RESOLVER,
            IPPROTO_TCP,
            1,
            (0, false),
            &tcp(src_port, dst_port, seq, syn, fin, payload),
        ))
    }
}
