//! Small shared types for the networking core.

use core::fmt;

/// Pseudo-ethertype that matches every frame: registering a packet-type
/// handler with this protocol id makes it a tap.
pub const ETH_P_ALL: u16 = 0x0003;

/// IPv4 ethertype, used throughout the tests as a representative protocol.
pub const ETH_P_IP: u16 = 0x0800;

/// ARP ethertype.
pub const ETH_P_ARP: u16 = 0x0806;

/// Longest device name, bytes.
pub const IFNAMSIZ: usize = 15;

/// Number of hash buckets in the packet-type registry.
pub const PTYPE_HASH_SIZE: usize = 16;

/// How a received frame relates to this host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PktType {
    /// Addressed to us.
    #[default]
    Host,
    /// Link-level broadcast.
    Broadcast,
    /// Link-level multicast.
    Multicast,
    /// Addressed to somebody else (seen in promiscuous mode).
    OtherHost,
    /// Locally generated, on its way out.
    Outgoing,
    /// Looped back by the loopback path.
    Loopback,
    /// Forwarded around the softirq straight to transmit.
    Fastroute,
}

/// Stable device index. Zero is never assigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ifindex(pub u32);

impl fmt::Debug for Ifindex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

impl fmt::Display for Ifindex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Major part of a traffic-control handle (discipline identity).
#[inline]
pub const fn th_major(h: u32) -> u32 {
    h & 0xFFFF_0000
}

/// Minor part of a traffic-control handle (class identity within it).
#[inline]
pub const fn th_minor(h: u32) -> u32 {
    h & 0x0000_FFFF
}

/// Compose a handle from its major and minor parts.
#[inline]
pub const fn th_make(major: u32, minor: u32) -> u32 {
    (major & 0xFFFF_0000) | (minor & 0x0000_FFFF)
}

/// The root parent sentinel used by the control plane.
pub const TH_ROOT: u32 = 0xFFFF_FFFF;
