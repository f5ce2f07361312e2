//! Reassembly of ENet fragments back into whole application messages.

use std::collections::{HashMap, HashSet};

use loopbridge_enet::{FragmentDescriptor, WrappedPacket};

use crate::FilterError;

/// Upper bound on a reassembled message.
pub const MAX_ASSEMBLED_LEN: u32 = 1024 * 1024;

/// Incomplete messages kept at once; the oldest is dropped beyond this.
pub const MAX_PENDING_ASSEMBLIES: usize = 64;

/// An incomplete message whose start sequence number trails a newer one on
/// the same channel by more than this is considered lost.
pub const STALE_SEQUENCE_WINDOW: u16 = 256;

#[derive(Debug)]
struct FragmentAssembly {
    fragment_count: u32,
    total_length: u32,
    buffer: Vec<u8>,
    received: HashSet<u32>,
    /// Creation order, for evicting the oldest.
    created: u64,
}

impl FragmentAssembly {
    fn new(descriptor: &FragmentDescriptor, created: u64) -> Self {
        Self {
            fragment_count: descriptor.fragment_count,
            total_length: descriptor.total_length,
            buffer: vec![0; descriptor.total_length as usize],
            received: HashSet::new(),
            created,
        }
    }

    fn matches(&self, descriptor: &FragmentDescriptor) -> bool {
        self.fragment_count == descriptor.fragment_count
            && self.total_length == descriptor.total_length
    }

    fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.fragment_count
    }
}

/// `older` lies more than the stale window behind `newer`, modulo wrap.
fn is_stale(older: u16, newer: u16) -> bool {
    let distance = newer.wrapping_sub(older);
    distance > STALE_SEQUENCE_WINDOW && distance < 0x8000
}

/// Collects fragments per `(channel, start sequence number)` and releases
/// a message only once every fragment index has arrived.
///
/// Fragments of lost messages do not linger: an assembly is dropped once
/// its channel has moved well past it, when the pending set overflows, or
/// when a fragment with a different shape claims its key.
#[derive(Debug, Default)]
pub struct Defragmenter {
    assemblies: HashMap<(u8, u16), FragmentAssembly>,
    next_created: u64,
}

impl Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages still waiting for fragments.
    pub fn pending(&self) -> usize {
        self.assemblies.len()
    }

    /// Feed one packet. Unfragmented packets come straight back out.
    pub fn push(&mut self, packet: WrappedPacket) -> Result<Option<WrappedPacket>, FilterError> {
        let Some(descriptor) = packet.fragment else {
            return Ok(Some(packet));
        };
        validate(&descriptor, packet.data.len())?;

        let channel_id = packet.channel_id;
        let start = descriptor.start_sequence_number;
        let key = (channel_id, start);

        let reusable = self
            .assemblies
            .get(&key)
            .map(|assembly| assembly.matches(&descriptor));
        if reusable != Some(true) {
            if reusable == Some(false) {
                tracing::debug!(channel_id, start, "defrag: message shape changed, restarting assembly");
            }
            self.evict_stale(channel_id, start);
            let created = self.next_created;
            self.next_created += 1;
            self.assemblies
                .insert(key, FragmentAssembly::new(&descriptor, created));
            self.evict_overflow();
        }

        let Some(assembly) = self.assemblies.get_mut(&key) else {
            return Ok(None);
        };
        let offset = descriptor.fragment_offset as usize;
        assembly.buffer[offset..offset + packet.data.len()].copy_from_slice(&packet.data);
        assembly.received.insert(descriptor.fragment_number);

        if !assembly.is_complete() {
            return Ok(None);
        }

        let assembly = self.assemblies.remove(&key);
        Ok(assembly.map(|a| WrappedPacket::new(channel_id, a.buffer)))
    }

    fn evict_stale(&mut self, channel_id: u8, start: u16) {
        let before = self.assemblies.len();
        self.assemblies
            .retain(|&(channel, older), _| channel != channel_id || !is_stale(older, start));
        let dropped = before - self.assemblies.len();
        if dropped > 0 {
            tracing::debug!(channel_id, start, dropped, "defrag: dropped stale assemblies");
        }
    }

    fn evict_overflow(&mut self) {
        while self.assemblies.len() > MAX_PENDING_ASSEMBLIES {
            let oldest = self
                .assemblies
                .iter()
                .min_by_key(|(_, assembly)| assembly.created)
                .map(|(key, _)| *key);
            match oldest {
                Some(key) => {
                    self.assemblies.remove(&key);
                    tracing::debug!(channel_id = key.0, start = key.1, "defrag: too many pending, dropped oldest");
                }
                None => return,
            }
        }
    }
}

fn validate(descriptor: &FragmentDescriptor, len: usize) -> Result<(), FilterError> {
    let out_of_bounds = || FilterError::FragmentOutOfBounds {
        start_sequence_number: descriptor.start_sequence_number,
        offset: descriptor.fragment_offset,
        len,
        total_length: descriptor.total_length,
    };

    if descriptor.total_length > MAX_ASSEMBLED_LEN {
        return Err(out_of_bounds());
    }
    let end = descriptor.fragment_offset as usize + len;
    if end > descriptor.total_length as usize {
        return Err(out_of_bounds());
    }
    if descriptor.fragment_count == 0 || descriptor.fragment_number >= descriptor.fragment_count {
        return Err(FilterError::FragmentMismatch {
            start_sequence_number: descriptor.start_sequence_number,
        });
    }
    Ok(())
}
