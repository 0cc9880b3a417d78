//! Compact poll clock.
//!
//! Poll start/end times travel in two bytes as whole hours counted from an
//! epoch anchor, so a u16 holds about seven and a half years. The anchor is
//! the timestamp of the last block at a multiple of [`EPOCH_SPAN_BLOCKS`],
//! which resets the clock before it can wrap.

use crate::poll::PollTime;

/// Blocks per year at one-minute cadence.
pub const YEARLY_BLOCKCOUNT: u64 = 525_600;
/// The poll clock re-anchors every four years of blocks.
pub const EPOCH_SPAN_BLOCKS: u64 = YEARLY_BLOCKCOUNT * 4;

/// Blocks of slack around an epoch rollover. A poll built just before the
/// rollover may only be mined just after it, so heights this close to a
/// boundary disambiguate by the poll-time value instead.
const EPOCH_BOUNDARY_PAD: u64 = 10_000;
/// Poll-times at or below this (100 days) near a boundary are read against
/// the newer anchor.
const EPOCH_BOUNDARY_LOW_HOURS: PollTime = 2_400;

/// Read access to chain state the poll clock and registry need.
pub trait ChainView {
    fn best_height(&self) -> u64;
    /// Timestamp of the chain tip, unix seconds.
    fn best_time(&self) -> i64;
    /// Timestamp of the block at `height`, unix seconds.
    fn time_at_height(&self, height: u64) -> i64;
}

fn anchor_hours(chain: &dyn ChainView, height: u64) -> i64 {
    let base_height = (height / EPOCH_SPAN_BLOCKS) * EPOCH_SPAN_BLOCKS;
    chain.time_at_height(base_height) / 60 / 60
}

/// Convert a unix timestamp to the compact clock at the chain tip.
pub fn to_poll_time(chain: &dyn ChainView, unix: i64) -> PollTime {
    to_poll_time_at(chain, unix, chain.best_height())
}

/// Convert a unix timestamp to the compact clock anchored at `height`.
pub fn to_poll_time_at(chain: &dyn ChainView, unix: i64, height: u64) -> PollTime {
    let hours = unix / 60 / 60 - anchor_hours(chain, height);
    if hours > 0 {
        hours.min(i64::from(PollTime::MAX)) as PollTime
    } else {
        0
    }
}

/// Expand a compact poll-time recorded at `height` back to unix seconds.
pub fn to_unix_time(chain: &dyn ChainView, ptime: PollTime, height: u64) -> i64 {
    let mut height = height;
    let nearest = ((height + EPOCH_SPAN_BLOCKS / 2) / EPOCH_SPAN_BLOCKS) * EPOCH_SPAN_BLOCKS;
    if nearest > 0 && height.abs_diff(nearest) < EPOCH_BOUNDARY_PAD {
        if ptime <= EPOCH_BOUNDARY_LOW_HOURS {
            // Too far behind to predate the rollover at this height.
            height += EPOCH_BOUNDARY_PAD;
        } else {
            // Too far ahead to postdate it.
            height = height.saturating_sub(EPOCH_BOUNDARY_PAD);
        }
    }

    (anchor_hours(chain, height) + i64::from(ptime)) * 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedChain {
        height: u64,
        tip_time: i64,
        anchor_time: i64,
    }

    impl ChainView for FixedChain {
        fn best_height(&self) -> u64 {
            self.height
        }

        fn best_time(&self) -> i64 {
            self.tip_time
        }

        fn time_at_height(&self, height: u64) -> i64 {
            if height == 0 {
                self.anchor_time
            } else {
                self.anchor_time + EPOCH_SPAN_BLOCKS as i64 * 60
            }
        }
    }

    #[test]
    fn compact_clock_round_trips_within_epoch() {
        let chain = FixedChain {
            height: 40_000,
            tip_time: 1_000_000_000,
            anchor_time: 999_000_000,
        };
        let unix = 999_900_000;
        let compact = to_poll_time(&chain, unix);
        let back = to_unix_time(&chain, compact, chain.height);
        // Hour granularity loses the sub-hour remainder.
        assert!((unix - back).abs() < 3_600);
    }

    #[test]
    fn times_before_the_anchor_clamp_to_zero() {
        let chain = FixedChain {
            height: 40_000,
            tip_time: 1_000_000_000,
            anchor_time: 999_000_000,
        };
        assert_eq!(to_poll_time(&chain, 10), 0);
    }

    #[test]
    fn boundary_heights_pick_anchor_by_poll_time() {
        let chain = FixedChain {
            height: EPOCH_SPAN_BLOCKS - 5_000,
            tip_time: 0,
            anchor_time: 1_000_000_000,
        };
        let early = to_unix_time(&chain, 100, chain.height);
        let late = to_unix_time(&chain, 3_000, chain.height);
        // The small poll-time resolves against the next anchor, the large
        // one against the previous; the small one lands later in absolute
        // time despite the smaller hour count.
        assert!(early > late);
    }
}
