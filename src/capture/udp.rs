use super::{packet::CapturedPacket, DnsPayload};

pub fn process_datagram(packet: CapturedPacket, port: u16) -> Option<DnsPayload> {
    if !packet.transport.matches_port(port) {
        return None;
    }
    Some(DnsPayload {
        network: packet.network,
        transport: packet.transport,
        protocol: packet.protocol(),
        timestamp: packet.timestamp,
        payload: packet.payload,
        malformed: false,
    })
}
