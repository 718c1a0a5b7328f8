//! Flow identity
//!
//! A flow is the set of packets sharing a 5-tuple, tracked bidirectionally:
//! the two directions of one connection must resolve to the same flow. The
//! key stores the tuple verbatim (as seen on the first packet, for collision
//! verification) while the hash functions are direction-insensitive, so the
//! reply direction lands in the same bucket and the same partition.

use std::net::IpAddr;

use crate::{DissectionInfo, KeyError, L4Proto};

/// Packet direction relative to the flow initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Same orientation as the packet that created the flow.
    ClientToServer,
    /// Reply orientation.
    ServerToClient,
}

impl Direction {
    /// The opposite direction.
    #[inline(always)]
    pub const fn flip(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// A pair of values, one per flow direction.
///
/// Replaces the classic `[2]`-indexed parallel arrays: indexing is by the
/// named [`Direction`] enum, so the two sides cannot be swapped silently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerDirection<T> {
    /// Value for the initiator direction.
    pub c2s: T,
    /// Value for the reply direction.
    pub s2c: T,
}

impl<T> PerDirection<T> {
    /// Borrow the value for `dir`.
    #[inline(always)]
    pub fn get(&self, dir: Direction) -> &T {
        match dir {
            Direction::ClientToServer => &self.c2s,
            Direction::ServerToClient => &self.s2c,
        }
    }

    /// Mutably borrow the value for `dir`.
    #[inline(always)]
    pub fn get_mut(&mut self, dir: Direction) -> &mut T {
        match dir {
            Direction::ClientToServer => &mut self.c2s,
            Direction::ServerToClient => &mut self.s2c,
        }
    }
}

/// 5-tuple flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source address.
    pub addr_src: IpAddr,
    /// Destination address.
    pub addr_dst: IpAddr,
    /// Source port.
    pub port_src: u16,
    /// Destination port.
    pub port_dst: u16,
    /// Transport protocol.
    pub l4_proto: L4Proto,
}

impl FlowKey {
    /// Build a key from a dissection record, orientation preserved.
    pub fn from_dissection(info: &DissectionInfo) -> Self {
        Self {
            addr_src: info.addr_src,
            addr_dst: info.addr_dst,
            port_src: info.port_src,
            port_dst: info.port_dst,
            l4_proto: info.l4_proto,
        }
    }

    /// The reply-direction key (endpoints swapped).
    #[inline(always)]
    pub fn reverse(&self) -> Self {
        Self {
            addr_src: self.addr_dst,
            addr_dst: self.addr_src,
            port_src: self.port_dst,
            port_dst: self.port_src,
            l4_proto: self.l4_proto,
        }
    }

    /// Direction of a packet with this orientation relative to `self`.
    ///
    /// Returns `None` when the packet does not belong to this flow at all.
    pub fn direction_of(&self, info: &DissectionInfo) -> Option<Direction> {
        let pkt = FlowKey::from_dissection(info);
        if pkt == *self {
            Some(Direction::ClientToServer)
        } else if pkt == self.reverse() {
            Some(Direction::ServerToClient)
        } else {
            None
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

#[inline(always)]
fn fnv1a(seed: u64, bytes: &[u8]) -> u64 {
    let mut h = seed;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// FNV-1a over one (address, port) endpoint.
#[inline(always)]
fn endpoint_hash(addr_bytes: &[u8], port: u16) -> u64 {
    let h = fnv1a(FNV_OFFSET, addr_bytes);
    fnv1a(h, &port.to_be_bytes())
}

/// Combine the two endpoint hashes commutatively, then mix in the protocol.
///
/// Commutativity is what makes the hash direction-insensitive: swapping
/// (src, sport) with (dst, dport) changes nothing.
#[inline(always)]
fn combine(ep_a: u64, ep_b: u64, proto: u8) -> u32 {
    let mixed = ep_a.wrapping_add(ep_b) ^ ep_a.wrapping_mul(ep_b);
    let h = fnv1a(mixed, &[proto]);
    (h ^ (h >> 32)) as u32
}

/// Direction-insensitive 32-bit hash for an IPv4 flow.
///
/// Exposed because multi-worker callers must compute the partition id
/// themselves before dispatching a packet to the right worker.
pub fn hash_v4(info: &DissectionInfo) -> Result<u32, KeyError> {
    match (info.addr_src, info.addr_dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let a = endpoint_hash(&src.octets(), info.port_src);
            let b = endpoint_hash(&dst.octets(), info.port_dst);
            Ok(combine(a, b, info.l4_proto.number()))
        }
        (IpAddr::V6(_), IpAddr::V6(_)) => Err(KeyError::V4Required),
        _ => Err(KeyError::MixedFamilies),
    }
}

/// Direction-insensitive 32-bit hash for an IPv6 flow.
pub fn hash_v6(info: &DissectionInfo) -> Result<u32, KeyError> {
    match (info.addr_src, info.addr_dst) {
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let a = endpoint_hash(&src.octets(), info.port_src);
            let b = endpoint_hash(&dst.octets(), info.port_dst);
            Ok(combine(a, b, info.l4_proto.number()))
        }
        (IpAddr::V4(_), IpAddr::V4(_)) => Err(KeyError::V6Required),
        _ => Err(KeyError::MixedFamilies),
    }
}

/// Hash dispatching on the record's address family.
pub fn flow_hash(info: &DissectionInfo) -> Result<u32, KeyError> {
    if info.is_v4() {
        hash_v4(info)
    } else if info.is_v6() {
        hash_v6(info)
    } else {
        Err(KeyError::MixedFamilies)
    }
}
