use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};

use super::packet::{IpPacket, PacketError};

pub const MAX_PENDING_GROUPS: usize = 4096;
pub const MAX_DATAGRAM_SIZE: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct GroupKey {
    src: IpAddr,
    dst: IpAddr,
    id: u32,
    protocol: u8,
}

struct FragmentGroup {
    fragments: BTreeMap<usize, Bytes>,
    received: usize,
    total: Option<usize>,
    first_seen: Instant,
}

impl FragmentGroup {
    fn overlaps(&self, offset: usize, end: usize) -> bool {
        let before = self
            .fragments
            .range(..offset)
            .next_back()
            .is_some_and(|(start, data)| start + data.len() > offset);
        let after = self
            .fragments
            .range(offset..)
            .next()
            .is_some_and(|(start, _)| *start < end);
        before || after
    }

    fn assemble(self) -> Bytes {
        let mut datagram = BytesMut::with_capacity(self.received);
        for data in self.fragments.into_values() {
            datagram.extend_from_slice(&data);
        }
        datagram.freeze()
    }
}

pub struct IpDefragmenter {
    groups: HashMap<GroupKey, FragmentGroup>,
    get_time: fn() -> Instant,
}

impl Default for IpDefragmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl IpDefragmenter {
    pub fn new() -> Self {
        Self::with_clock(Instant::now)
    }

    fn with_clock(get_time: fn() -> Instant) -> Self {
        Self {
            groups: HashMap::new(),
            get_time,
        }
    }

    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// Unfragmented packets pass straight through. A fragment yields the
    /// whole datagram once its group is complete. An error aborts the
    /// fragment's group only.
    pub fn defrag(&mut self, packet: IpPacket) -> Result<Option<IpPacket>, PacketError> {
        let fragment = match packet.fragment {
            None => return Ok(Some(packet)),
            Some(fragment) => fragment,
        };
        let key = GroupKey {
            src: packet.network.src,
            dst: packet.network.dst,
            id: fragment.id,
            protocol: packet.protocol,
        };
        let end = fragment.offset + packet.payload.len();
        if end > MAX_DATAGRAM_SIZE {
            self.groups.remove(&key);
            return Err(PacketError::TooLarge(MAX_DATAGRAM_SIZE));
        }
        if !self.groups.contains_key(&key) && self.groups.len() >= MAX_PENDING_GROUPS {
            return Err(PacketError::TooManyGroups(MAX_PENDING_GROUPS));
        }
        let now = (self.get_time)();
        let group = self.groups.entry(key).or_insert_with(|| FragmentGroup {
            fragments: BTreeMap::new(),
            received: 0,
            total: None,
            first_seen: now,
        });
        if let Some(existing) = group.fragments.get(&fragment.offset) {
            if *existing == packet.payload {
                // retransmitted duplicate
                return Ok(None);
            }
        }
        if group.overlaps(fragment.offset, end) || group.total.is_some_and(|total| end > total) {
            self.groups.remove(&key);
            return Err(PacketError::Overlap(fragment.id));
        }
        if !fragment.more {
            let beyond_end = group
                .fragments
                .keys()
                .next_back()
                .is_some_and(|offset| *offset >= end);
            if group.received > end || beyond_end {
                self.groups.remove(&key);
                return Err(PacketError::Overlap(fragment.id));
            }
            group.total = Some(end);
        }
        group.received += packet.payload.len();
        group.fragments.insert(fragment.offset, packet.payload);

        if group.total != Some(group.received) {
            return Ok(None);
        }
        let group = match self.groups.remove(&key) {
            Some(group) => group,
            None => return Ok(None),
        };
        Ok(Some(IpPacket {
            network: packet.network,
            protocol: packet.protocol,
            fragment: None,
            timestamp: packet.timestamp,
            payload: group.assemble(),
        }))
    }

    pub fn discard_older_than(&mut self, age: Duration) -> usize {
        let now = (self.get_time)();
        let before = self.groups.len();
        self.groups
            .retain(|_, group| now.saturating_duration_since(group.first_seen) < age);
        before - self.groups.len()
    }
}
