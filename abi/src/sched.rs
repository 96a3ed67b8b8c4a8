//! Traffic-control parameter structs.
//!
//! These are the payloads the control plane carries into the queueing
//! discipline layer: rate descriptions, link-sharing parameters, weighted
//! round-robin parameters, overlimit strategies, and filter-default maps.

use bitflags::bitflags;

/// Number of logical packet priorities (TOS bands) understood by defmaps.
pub const TC_PRIO_MAX: usize = 15;

/// The priority used for traffic with no stronger claim.
pub const TC_PRIO_BESTEFFORT: usize = 0;

/// Number of CBQ scheduling bands. Band 0 is served first.
///
/// The band at index `CBQ_MAXPRIO` is reserved: classes parked there by the
/// delay overlimit strategy are invisible to the dequeue scan.
pub const CBQ_MAXPRIO: usize = 8;

/// Deepest class-tree level the borrowing cutoff can take.
pub const CBQ_MAXLEVEL: u8 = 8;

/// Default EWMA time-constant log for idle averaging.
pub const CBQ_DEF_EWMA: u8 = 5;

/// Description of a configured bit-rate, from which a length-to-ticks
/// transmission-time table is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateSpec {
    /// Rate in bytes per second.
    pub rate: u32,
    /// log2 of the byte granularity of one table cell.
    pub cell_log: u8,
    /// Minimum packet size ever charged.
    pub mpu: u16,
    /// Fixed per-packet framing overhead added to the length.
    pub overhead: u16,
}

bitflags! {
    /// Link-sharing behaviour flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LssFlags: u8 {
        /// The class may not borrow from its parent.
        const BOUNDED  = 1 << 0;
        /// The class does not lend to siblings (no share parent).
        const ISOLATED = 1 << 1;
    }
}

bitflags! {
    /// Which fields of an [`LssOpt`] are to be applied.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LssChange: u8 {
        const FLAGS   = 1 << 0;
        const EWMA    = 1 << 1;
        const AVPKT   = 1 << 2;
        const MINIDLE = 1 << 3;
        const MAXIDLE = 1 << 4;
        const OFFTIME = 1 << 5;
    }
}

/// Link-sharing scheduler parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct LssOpt {
    /// Selects which of the remaining fields take effect.
    pub change: LssChange,
    pub flags: LssFlags,
    /// EWMA time constant is `2^ewma_log`.
    pub ewma_log: u8,
    /// Average packet size used for idle estimation, bytes.
    pub avpkt: u32,
    /// Largest credit `avgidle` may accumulate, ticks.
    pub maxidle: u32,
    /// Deepest debt allowed, ticks; stored negated.
    pub minidle: u32,
    /// Extra sleep applied by the classic overlimit action, ticks.
    pub offtime: i64,
}

/// Weighted round-robin parameters.
///
/// A zero field means "leave the current value"; `priority` is 1-based on
/// the wire and 0-based internally.
#[derive(Clone, Copy, Debug, Default)]
pub struct WrrOpt {
    /// Per-round byte allotment before normalisation.
    pub allot: u32,
    /// Scheduling band, 1..=[`CBQ_MAXPRIO`].
    pub priority: u8,
    /// Relative share of the band's bandwidth.
    pub weight: u32,
}

/// What to do when a class is caught over its configured rate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OvlStrategy {
    /// Penalise the leaf by `offtime` and sleep until under limit.
    #[default]
    Classic,
    /// Apply the classic penalty to the shallowest borrowable ancestor.
    RClassic,
    /// Park the class in the reserved band until an explicit undelay.
    Delay,
    /// Demote the class to `priority2` until the penalty expires.
    LowPrio,
    /// Drop one queued packet, then apply the classic penalty.
    Drop,
}

/// Overlimit strategy selection.
#[derive(Clone, Copy, Debug)]
pub struct OvlOpt {
    pub strategy: OvlStrategy,
    /// Band used while demoted, 1-based; only for [`OvlStrategy::LowPrio`].
    pub priority2: u8,
    /// Penalty duration in ticks for the delay/low-priority strategies.
    pub penalty: u64,
}

/// Filter-default map update: routes packet priorities to default classes
/// at a split node.
#[derive(Clone, Copy, Debug, Default)]
pub struct FOpt {
    /// Class id of the split node; 0 keeps the current split.
    pub split: u32,
    /// New default bits.
    pub defmap: u32,
    /// Which bits of `defmap` take effect.
    pub defchange: u32,
}

/// Policing verdict configured on a class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoliceAction {
    /// Accept.
    #[default]
    Ok,
    /// Re-run classification starting from the ancestors' defaults.
    Reclassify,
    /// Drop the packet.
    Shot,
}
