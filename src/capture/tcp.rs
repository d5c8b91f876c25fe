use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    time::{Duration, Instant, SystemTime},
};

use bytes::{Buf, Bytes, BytesMut};

use super::{
    packet::{CapturedPacket, NetworkFlow, Transport, TransportFlow},
    DnsPayload,
};
use crate::message::Protocol;

pub const MAX_BUFFERED_SEGMENTS: usize = 256;

// wrapped offsets at or above this lie before the stream start
const BACKWARD_OFFSET: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Length,
    Body(usize),
}

#[derive(Debug)]
struct DnsFramer {
    state: FrameState,
    buf: BytesMut,
}

impl DnsFramer {
    fn new() -> Self {
        Self {
            state: FrameState::Length,
            buf: BytesMut::new(),
        }
    }

    fn push(&mut self, data: &[u8], out: &mut Vec<(Bytes, bool)>) {
        self.buf.extend_from_slice(data);
        loop {
            match self.state {
                FrameState::Length if self.buf.len() >= 2 => {
                    let length = self.buf.get_u16() as usize;
                    if length > 0 {
                        self.state = FrameState::Body(length);
                    }
                }
                FrameState::Body(length) if self.buf.len() >= length => {
                    out.push((self.buf.split_to(length).freeze(), false));
                    self.state = FrameState::Length;
                }
                _ => break,
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<(Bytes, bool)>) {
        if !self.buf.is_empty() || self.state != FrameState::Length {
            out.push((self.buf.split().freeze(), true));
        }
        self.state = FrameState::Length;
    }
}

/// One direction of a TCP connection. Until its SYN is seen, segments are
/// only buffered, with `base` at the lowest sequence number so far.
struct HalfStream {
    network: NetworkFlow,
    transport: TransportFlow,
    base: Option<u32>,
    synced: bool,
    next: u32,
    pending: BTreeMap<u32, Bytes>,
    framer: DnsFramer,
    fin: bool,
    timestamp: SystemTime,
}

impl HalfStream {
    fn new(packet: &CapturedPacket) -> Self {
        Self {
            network: packet.network,
            transport: packet.transport,
            base: None,
            synced: false,
            next: 0,
            pending: BTreeMap::new(),
            framer: DnsFramer::new(),
            fin: false,
            timestamp: packet.timestamp,
        }
    }

    fn segment(&mut self, seq: u32, syn: bool, data: Bytes, out: &mut Vec<(Bytes, bool)>) {
        let seq = if syn {
            if !self.synced {
                self.rebase(seq.wrapping_add(1));
                self.synced = true;
            }
            seq.wrapping_add(1)
        } else {
            seq
        };
        if !data.is_empty() {
            self.insert(seq, data);
        }
        if self.synced {
            self.deliver_ready(out);
        }
        if self.pending.len() > MAX_BUFFERED_SEGMENTS {
            self.synced = true;
            self.skip_gap(out);
        }
    }

    fn insert(&mut self, seq: u32, data: Bytes) {
        let base = *self.base.get_or_insert(seq);
        let mut offset = seq.wrapping_sub(base);
        if offset >= BACKWARD_OFFSET {
            if self.synced {
                return;
            }
            self.rebase(seq);
            offset = 0;
        }
        self.pending
            .entry(offset)
            .and_modify(|existing| {
                if data.len() > existing.len() {
                    *existing = data.clone();
                }
            })
            .or_insert(data);
    }

    fn rebase(&mut self, base: u32) {
        if let Some(previous) = self.base.replace(base) {
            let shift = previous.wrapping_sub(base);
            self.pending = std::mem::take(&mut self.pending)
                .into_iter()
                .map(|(offset, data)| (offset.wrapping_add(shift), data))
                .filter(|(offset, _)| *offset < BACKWARD_OFFSET)
                .collect();
        }
    }

    fn deliver_ready(&mut self, out: &mut Vec<(Bytes, bool)>) {
        while let Some(entry) = self.pending.first_entry() {
            let offset = *entry.key();
            if offset > self.next {
                break;
            }
            let data = entry.remove();
            let end = offset.wrapping_add(data.len() as u32);
            if end <= self.next {
                continue;
            }
            let skip = (self.next - offset) as usize;
            self.framer.push(&data[skip..], out);
            self.next = end;
        }
    }

    fn skip_gap(&mut self, out: &mut Vec<(Bytes, bool)>) {
        if let Some(&offset) = self.pending.keys().next() {
            self.framer.flush(out);
            self.next = offset;
            self.deliver_ready(out);
        }
    }

    fn flush(&mut self, out: &mut Vec<(Bytes, bool)>) {
        while !self.pending.is_empty() {
            self.skip_gap(out);
        }
        self.framer.flush(out);
    }

    fn emit(&self, messages: Vec<(Bytes, bool)>, output: &mut Vec<DnsPayload>) {
        output.extend(messages.into_iter().map(|(payload, malformed)| DnsPayload {
            network: self.network,
            transport: self.transport,
            protocol: Protocol::Tcp,
            timestamp: self.timestamp,
            payload,
            malformed,
        }));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey(SocketAddr, SocketAddr);

impl FlowKey {
    fn of(packet: &CapturedPacket) -> (Self, usize) {
        let src = SocketAddr::new(packet.network.src, packet.transport.src);
        let dst = SocketAddr::new(packet.network.dst, packet.transport.dst);
        if src <= dst {
            (FlowKey(src, dst), 0)
        } else {
            (FlowKey(dst, src), 1)
        }
    }
}

struct Flow {
    halves: [Option<HalfStream>; 2],
    last_seen: Instant,
}

impl Flow {
    fn flush(&mut self, output: &mut Vec<DnsPayload>) {
        for half in self.halves.iter_mut().flatten() {
            let mut messages = Vec::new();
            half.flush(&mut messages);
            half.emit(messages, output);
        }
    }
}

pub struct TcpAssembler {
    flows: HashMap<FlowKey, Flow>,
    get_time: fn() -> Instant,
}

impl Default for TcpAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpAssembler {
    pub fn new() -> Self {
        Self::with_clock(Instant::now)
    }

    fn with_clock(get_time: fn() -> Instant) -> Self {
        Self {
            flows: HashMap::new(),
            get_time,
        }
    }

    pub fn flows(&self) -> usize {
        self.flows.len()
    }

    pub fn assemble(&mut self, packet: CapturedPacket) -> Vec<DnsPayload> {
        let header = match packet.kind {
            Transport::Tcp(header) => header,
            Transport::Udp => return Vec::new(),
        };
        let now = (self.get_time)();
        let (key, direction) = FlowKey::of(&packet);
        let flow = self.flows.entry(key).or_insert_with(|| Flow {
            halves: [None, None],
            last_seen: now,
        });
        flow.last_seen = now;

        let mut output = Vec::new();
        let half = flow.halves[direction].get_or_insert_with(|| HalfStream::new(&packet));
        half.timestamp = packet.timestamp;
        let mut messages = Vec::new();
        half.segment(header.seq, header.syn, packet.payload, &mut messages);
        half.emit(messages, &mut output);
        if header.fin {
            half.fin = true;
        }

        let closed = header.rst
            || flow
                .halves
                .iter()
                .all(|half| half.as_ref().is_some_and(|half| half.fin));
        if closed {
            flow.flush(&mut output);
            self.flows.remove(&key);
        }
        output
    }

    pub fn evict_idle(&mut self, timeout: Duration) -> Vec<DnsPayload> {
        let now = (self.get_time)();
        let mut output = Vec::new();
        self.flows.retain(|_, flow| {
            if now.saturating_duration_since(flow.last_seen) < timeout {
                return true;
            }
            flow.flush(&mut output);
            false
        });
        output
    }

    pub fn flush_all(&mut self) -> Vec<DnsPayload> {
        let mut output = Vec::new();
        for (_, mut flow) in self.flows.drain() {
            flow.flush(&mut output);
        }
        output
    }
}
