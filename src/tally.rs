//! Ballot payload codec and the tally application paths.
//!
//! Ballots travel in block payloads as packed pairs: two poll ids followed
//! by a shared selection byte (low nibble first ballot, high nibble second),
//! with a lone five-byte tail when the count is odd and a leading count
//! byte over the whole payload.

use std::collections::BTreeMap;

use crate::error::{malformed, Result};
use crate::poll::{Ballot, OptionId, PollFlags, PollId};
use crate::registry::VoteIndex;

/// Smallest sub-unit per whole coin; donation tallies count whole coins.
pub const COIN: u64 = 1_000_000;

/// Most ballots a single block payload may carry.
pub const MAX_BALLOTS_PER_BLOCK: usize = 100;

/// Block proof types that can carry ballot payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofType {
    Pos,
    Fpos,
    Pow,
}

impl ProofType {
    /// The poll flag bit that must be set for this proof type's ballots.
    pub fn required_flag(self) -> u8 {
        match self {
            ProofType::Pos => PollFlags::ALLOW_POS,
            ProofType::Fpos => PollFlags::ALLOW_FPOS,
            ProofType::Pow => PollFlags::ALLOW_POW,
        }
    }

    /// Whether a poll takes ballots of this proof type. The empty flag set
    /// is the POS-only default, so POS is accepted without its bit.
    pub fn permitted_by(self, flags: PollFlags) -> bool {
        match self {
            ProofType::Pos => flags.accepts_pos(),
            ProofType::Fpos => flags.accepts_fpos(),
            ProofType::Pow => flags.accepts_pow(),
        }
    }
}

/// Pack ballots for a block payload. Empty input yields an empty payload.
pub fn pack_ballots(ballots: &[Ballot]) -> Vec<u8> {
    let take = ballots.len().min(MAX_BALLOTS_PER_BLOCK);
    if take == 0 {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(1 + (take / 2) * 9 + (take % 2) * 5);
    out.push(take as u8);
    for pair in ballots[..take].chunks(2) {
        out.extend_from_slice(&pair[0].poll_id.to_le_bytes());
        match pair {
            [first, second] => {
                out.extend_from_slice(&second.poll_id.to_le_bytes());
                out.push((first.selection & 0x0F) | (second.selection << 4));
            }
            [only] => out.push(only.selection & 0x0F),
            _ => unreachable!("chunks(2)"),
        }
    }
    out
}

/// Unpack a block ballot payload. The payload must consume exactly and the
/// decoded count must match the leading count byte; duplicate poll ids keep
/// their first occurrence.
pub fn unpack_ballots(payload: &[u8]) -> Result<BTreeMap<PollId, Ballot>> {
    let mut ballots = BTreeMap::new();
    if payload.is_empty() {
        return Ok(ballots);
    }
    if payload.len() < 6 {
        return Err(malformed("ballot payload below minimum size"));
    }

    let declared = payload[0];
    let mut rest = &payload[1..];
    let mut count = 0u16;

    let mut push = |id: PollId, selection: OptionId, map: &mut BTreeMap<PollId, Ballot>| {
        map.entry(id).or_insert(Ballot {
            poll_id: id,
            selection,
        });
    };

    loop {
        if rest.len() > 8 {
            let first = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
            let second = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
            push(first, rest[8] & 0x0F, &mut ballots);
            push(second, rest[8] >> 4, &mut ballots);
            count += 2;
            rest = &rest[9..];
        } else if rest.len() == 5 {
            let id = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
            push(id, rest[4] & 0x0F, &mut ballots);
            count += 1;
            rest = &rest[5..];
        } else if rest.is_empty() {
            if count == u16::from(declared) {
                return Ok(ballots);
            }
            return Err(malformed("ballot count disagrees with payload"));
        } else {
            return Err(malformed("ballot payload has trailing bytes"));
        }
    }
}

/// Collect this wallet's castable ballots for a block of the given proof
/// type, scanning in poll-id order from `start_offset`. Returns the packed
/// payload, empty when nothing qualifies.
pub fn select_ballots(index: &VoteIndex, proof: ProofType, start_offset: usize) -> Vec<u8> {
    let now = index.now();

    let picked: Vec<Ballot> = index
        .ballots()
        .values()
        .skip(start_offset)
        .filter(|ballot| ballot.selection != 0)
        .filter(|ballot| {
            index
                .confirmed()
                .get(&ballot.poll_id)
                .map(|poll| proof.permitted_by(poll.flags) && poll.is_active(now))
                .unwrap_or(false)
        })
        .take(MAX_BALLOTS_PER_BLOCK)
        .copied()
        .collect();

    pack_ballots(&picked)
}

/// Split ballots into the tally-able set and the rejects for this proof
/// type. A ballot is rejected when its poll is unknown, the poll refuses
/// the proof type, or the selection is absent or out of range.
pub fn verify_ballots(
    index: &VoteIndex,
    ballots: &BTreeMap<PollId, Ballot>,
    proof: ProofType,
) -> (BTreeMap<PollId, Ballot>, Vec<Ballot>) {
    let mut valid = BTreeMap::new();
    let mut invalid = Vec::new();

    for ballot in ballots.values() {
        let ok = index.confirmed().get(&ballot.poll_id).is_some_and(|poll| {
            proof.permitted_by(poll.flags)
                && ballot.selection != 0
                && usize::from(ballot.selection) <= poll.tally.len()
        });
        if ok {
            valid.insert(ballot.poll_id, *ballot);
        } else {
            invalid.push(*ballot);
        }
    }
    (valid, invalid)
}

/// Tally a block's ballots into the confirmed polls, persisting each poll
/// touched. `undo` reverses a previously applied block during reorg; the
/// counters saturate rather than wrap.
pub fn apply_ballots(
    index: &mut VoteIndex,
    ballots: &BTreeMap<PollId, Ballot>,
    proof: ProofType,
    undo: bool,
) -> Result<()> {
    let (valid, invalid) = verify_ballots(index, ballots, proof);
    if !invalid.is_empty() {
        log::info!("removed {} bad ballots before tallying", invalid.len());
    }

    for ballot in valid.values() {
        index.with_confirmed_poll(ballot.poll_id, |poll| {
            let slot = usize::from(ballot.selection) - 1;
            let tally = &mut poll.tally[slot];
            let column = match proof {
                ProofType::Pos => &mut tally.pos,
                ProofType::Fpos => &mut tally.fpos,
                ProofType::Pow => &mut tally.pow,
            };
            *column = if undo {
                column.saturating_sub(1)
            } else {
                column.saturating_add(1)
            };
        })?;
    }
    Ok(())
}

/// Tally a donation-carrying transaction ballot in whole coins. Returns
/// false when the poll is unknown or the selection is out of range.
pub fn apply_donation(
    index: &mut VoteIndex,
    ballot: &Ballot,
    coins: u64,
    undo: bool,
) -> Result<bool> {
    let in_range = index
        .confirmed()
        .get(&ballot.poll_id)
        .is_some_and(|poll| {
            ballot.selection != 0 && usize::from(ballot.selection) <= poll.tally.len()
        });
    if !in_range {
        return Ok(false);
    }

    let whole = (coins / COIN) as u32;
    index.with_confirmed_poll(ballot.poll_id, |poll| {
        let donation = &mut poll.tally[usize::from(ballot.selection) - 1].donation;
        *donation = if undo {
            donation.saturating_sub(whole)
        } else {
            donation.saturating_add(whole)
        };
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballots(n: usize) -> Vec<Ballot> {
        (0..n)
            .map(|i| Ballot {
                poll_id: 1_000 + i as u32,
                selection: (i % 6 + 1) as u8,
            })
            .collect()
    }

    #[test]
    fn packs_every_parity() {
        for n in [0usize, 1, 2, 3, 37, 100] {
            let input = ballots(n);
            let payload = pack_ballots(&input);
            if n == 0 {
                assert!(payload.is_empty());
                continue;
            }
            assert_eq!(payload.len(), 1 + n / 2 * 9 + n % 2 * 5);
            let unpacked = unpack_ballots(&payload).unwrap();
            assert_eq!(unpacked.len(), n);
            for ballot in &input {
                assert_eq!(unpacked[&ballot.poll_id], *ballot);
            }
        }
    }

    #[test]
    fn truncates_beyond_block_limit() {
        let payload = pack_ballots(&ballots(150));
        assert_eq!(payload[0], 100);
        assert_eq!(unpack_ballots(&payload).unwrap().len(), 100);
    }

    #[test]
    fn rejects_bad_payloads() {
        let payload = pack_ballots(&ballots(4));

        // Trailing garbage leaves a remainder that is neither 9, 5 nor 0.
        let mut trailing = payload.clone();
        trailing.extend_from_slice(&[1, 2, 3]);
        assert!(unpack_ballots(&trailing).is_err());

        // Count byte disagreeing with the body.
        let mut short_count = payload.clone();
        short_count[0] = 3;
        assert!(unpack_ballots(&short_count).is_err());

        assert!(unpack_ballots(&[4, 0, 0]).is_err());
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let mut pair = ballots(2);
        pair[1].poll_id = pair[0].poll_id;
        pair[0].selection = 2;
        pair[1].selection = 5;
        let unpacked = unpack_ballots(&pack_ballots(&pair)).unwrap();
        assert_eq!(unpacked.len(), 1);
        assert_eq!(unpacked[&pair[0].poll_id].selection, 2);
    }
}
