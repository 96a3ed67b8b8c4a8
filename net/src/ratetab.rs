//! Transmission-time rate tables.
//!
//! A rate table maps a packet length to the number of ticks a packet of
//! that length occupies a link of the configured rate. The table has 256
//! cells; a cell covers `1 << cell_log` bytes, so lookup is a shift and an
//! index. `mpu` floors the charged size and `overhead` adds fixed framing
//! cost, both before the cell rounding.

use rill_abi::{NetError, RateSpec};
use rill_lib::clock::TICKS_PER_SEC;

/// Number of cells in a rate table.
pub const RTAB_CELLS: usize = 256;

/// Precomputed length → transmission-ticks table for one configured rate.
#[derive(Clone)]
pub struct RateTable {
    spec: RateSpec,
    data: [u64; RTAB_CELLS],
}

impl RateTable {
    /// Build a table for `spec`. The rate must be non-zero and the cell
    /// granularity must keep every cell cost representable.
    pub fn new(spec: RateSpec) -> Result<Self, NetError> {
        if spec.rate == 0 || spec.cell_log >= 32 {
            return Err(NetError::Inval);
        }
        let mut data = [0u64; RTAB_CELLS];
        for (i, cell) in data.iter_mut().enumerate() {
            let mut size = ((i as u64 + 1) << spec.cell_log) + spec.overhead as u64;
            if size < spec.mpu as u64 {
                size = spec.mpu as u64;
            }
            *cell = size * TICKS_PER_SEC / spec.rate as u64;
        }
        Ok(Self { spec, data })
    }

    /// The spec this table was built from.
    #[inline]
    pub fn spec(&self) -> RateSpec {
        self.spec
    }

    /// Configured rate, bytes per second.
    #[inline]
    pub fn rate(&self) -> u32 {
        self.spec.rate
    }

    /// Ticks needed to transmit `len` bytes at this rate.
    #[inline]
    pub fn l2t(&self, len: u32) -> i64 {
        let idx = ((len >> self.spec.cell_log) as usize).min(RTAB_CELLS - 1);
        self.data[idx] as i64
    }
}

/// Smallest `cell_log` for which every length up to `mtu` lands inside the
/// table. The usual way to fill [`RateSpec::cell_log`].
pub fn cell_log_for_mtu(mtu: u32) -> u8 {
    let mut cell_log = 0u8;
    while (mtu >> cell_log) as usize >= RTAB_CELLS {
        cell_log += 1;
    }
    cell_log
}
