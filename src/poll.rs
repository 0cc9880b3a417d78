//! Poll and ballot records plus the consensus arithmetic evaluated on them.

use serde::{Deserialize, Serialize};

/// Wire-fixed field widths. Encoded polls pad every field to these sizes.
pub const POLL_ID_SIZE: usize = 4;
pub const POLL_NAME_SIZE: usize = 20;
pub const POLL_QUESTION_SIZE: usize = 100;
pub const POLL_OPTION_SIZE: usize = 45;
pub const POLL_ADDRESS_SIZE: usize = 33;
/// Maximum options an encoded poll can carry (3 bits of header space).
pub const POLL_MAX_OPTIONS: usize = 6;

/// Poll identifier; 0 is the "no poll" sentinel and never names a real poll.
pub type PollId = u32;
/// Hours since the current poll-time epoch anchor.
pub type PollTime = u16;
/// 1-based option selection; 0 means no selection has been made.
pub type OptionId = u8;

/// Fixed-point scale for consensus ratios.
pub const PRECISION: u64 = 10_000;

/// The donation column of a consensus tally only contributes when the poll
/// accepts POS votes. The original subsystem shipped with this coupling and
/// recorded tallies depend on it, so it is preserved rather than corrected.
pub const DONATION_RATIO_USES_POS_ACCEPTANCE: bool = true;

/// Per-option vote counters, one column per proof type plus donations.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub pos: u32,
    pub fpos: u32,
    pub pow: u32,
    pub donation: u32,
}

/// Poll behavior bitset.
///
/// An empty value (`ENFORCE_POS`) means the default poll type: POS votes
/// only. The forced composites reshape the option list when the command
/// surface applies them.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash,
)]
pub struct PollFlags(pub u8);

impl PollFlags {
    pub const ENFORCE_POS: u8 = 0;
    pub const ALLOW_POS: u8 = 1 << 0;
    pub const ALLOW_FPOS: u8 = 1 << 1;
    pub const ALLOW_POW: u8 = 1 << 2;
    pub const ALLOW_DONATION: u8 = 1 << 3;
    pub const PAY_TO_POLL: u8 = 1 << 4;
    pub const FUNDRAISER: u8 = 1 << 5;
    pub const BOUNTY_BIT: u8 = 1 << 6;
    pub const CLAIM_BIT: u8 = 1 << 7;

    /// A bounty escrows funds with the poll itself.
    pub const BOUNTY: u8 = Self::BOUNTY_BIT | Self::FUNDRAISER | Self::PAY_TO_POLL;
    /// Claim polls accept all three proof-of-work/stake vote types.
    pub const CLAIM: u8 = Self::CLAIM_BIT | Self::ALLOW_POS | Self::ALLOW_FPOS | Self::ALLOW_POW;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    pub fn insert(&mut self, mask: u8) {
        self.0 |= mask;
    }

    pub fn remove(&mut self, mask: u8) {
        self.0 &= !mask;
    }

    pub fn accepts_pos(self) -> bool {
        self.contains(Self::ALLOW_POS) || self.0 == Self::ENFORCE_POS
    }

    pub fn accepts_fpos(self) -> bool {
        self.contains(Self::ALLOW_FPOS)
    }

    pub fn accepts_pow(self) -> bool {
        self.contains(Self::ALLOW_POW)
    }

    pub fn accepts_donation(self) -> bool {
        self.contains(Self::ALLOW_DONATION)
    }

    pub fn is_fund(self) -> bool {
        self.contains(Self::FUNDRAISER)
    }

    pub fn is_bounty(self) -> bool {
        self.0 == Self::BOUNTY
    }

    pub fn is_pay_to_poll(self) -> bool {
        self.contains(Self::PAY_TO_POLL)
    }

    pub fn is_claim(self) -> bool {
        self.0 == Self::CLAIM
    }

    /// True when the bitset names one of the forced shapes that takes over
    /// the whole flag byte and the option list.
    pub fn is_forced(self) -> bool {
        self.contains(Self::FUNDRAISER | Self::BOUNTY_BIT | Self::CLAIM_BIT)
    }

    /// Drop any forced-shape bits while keeping the plain vote-type bits.
    pub fn unset_forced(&mut self) {
        self.remove(Self::FUNDRAISER | Self::BOUNTY_BIT | Self::CLAIM_BIT | Self::PAY_TO_POLL);
    }
}

/// One wallet-local vote: which option of which poll.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub poll_id: PollId,
    pub selection: OptionId,
}

impl Ballot {
    pub fn new(poll_id: PollId) -> Self {
        Self {
            poll_id,
            selection: 0,
        }
    }
}

/// A poll record. `hash` and `height` stay empty/zero while the poll is a
/// local draft and are filled in once the chain confirms it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub name: String,
    pub question: String,
    pub flags: PollFlags,
    pub start: PollTime,
    pub end: PollTime,
    pub options: Vec<String>,
    pub tally: Vec<Tally>,
    pub address: String,
    pub hash: String,
    pub height: u64,
}

impl Poll {
    pub fn op_count(&self) -> u8 {
        self.options.len() as u8
    }

    /// Keep the tally vector paired one-to-one with the option list.
    pub fn sync_tally(&mut self) {
        self.tally.resize(self.options.len(), Tally::default());
    }

    pub fn is_active(&self, now: PollTime) -> bool {
        self.start < now && now < self.end
    }

    pub fn has_ended(&self, now: PollTime) -> bool {
        self.end < now
    }

    /// Structural completeness. `is_local` reflects whether the poll is
    /// absent from the confirmed set; confirmed polls additionally need
    /// their chain coordinates filled in.
    pub fn is_complete(&self, is_local: bool) -> bool {
        if self.name.len() < 2
            || self.question.len() < 6
            || self.end <= self.start
            || self.id == 0
            || self.address.len() < 26
        {
            return false;
        }

        let confirmed = self.height > 0 && !self.hash.is_empty();
        if self.options.len() > 1 && (confirmed || is_local) {
            return true;
        }
        // Fundraisers carry a single funding option.
        self.flags.is_fund() && !self.options.is_empty() && (confirmed || is_local)
    }

    /// Consensus polls carry the canonical Approve/Disapprove shape; option
    /// slot 0 is overloaded with the parent poll id for claim polls.
    pub fn is_consensus(&self) -> bool {
        if self.options.len() != 3 || self.tally.len() != 3 {
            return false;
        }
        if self.options[1] != "Approve" || self.options[2] != "Disapprove" {
            return false;
        }
        self.flags
            .contains(PollFlags::CLAIM_BIT | PollFlags::ALLOW_DONATION)
            || self.flags.bits() == PollFlags::ENFORCE_POS
    }

    /// Parent poll id for claim polls, parsed out of option slot 0.
    pub fn parent_id(&self) -> Option<PollId> {
        let raw = self.options.first()?;
        match raw.trim().parse::<PollId>() {
            Ok(0) | Err(_) => None,
            Ok(id) => Some(id),
        }
    }

    /// Field-for-field equality used for collision detection on commit.
    pub fn matches(&self, other: &Poll) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.question == other.question
            && self.start == other.start
            && self.end == other.end
            && self.flags == other.flags
            && self.hash == other.hash
            && self.height == other.height
            && self.options == other.options
            && self.tally == other.tally
    }

    /// Approval ratio scaled by [`PRECISION`], averaged over the proof
    /// types this poll accepts. Empty columns count as an even split.
    /// `None` when the poll is not a complete consensus poll.
    pub fn consensus_ratio(&self, is_local: bool) -> Option<u64> {
        if !self.is_consensus() || !self.is_complete(is_local) {
            return None;
        }

        let mut contributions = 0u64;
        let mut accumulated = 0u64;
        let mut add = |approve: u32, disapprove: u32| {
            let approved = u64::from(approve) * PRECISION;
            let total = (u64::from(approve) + u64::from(disapprove)) * PRECISION;
            accumulated += if total > 0 {
                approved * PRECISION / total
            } else {
                PRECISION / 2
            };
            contributions += 1;
        };

        if self.flags.accepts_pos() {
            add(self.tally[1].pos, self.tally[2].pos);
        }
        if self.flags.accepts_fpos() {
            add(self.tally[1].fpos, self.tally[2].fpos);
        }
        if self.flags.accepts_pow() {
            add(self.tally[1].pow, self.tally[2].pow);
        }
        let donation_gate = if DONATION_RATIO_USES_POS_ACCEPTANCE {
            self.flags.accepts_pos()
        } else {
            self.flags.accepts_donation()
        };
        if donation_gate {
            add(self.tally[1].donation, self.tally[2].donation);
        }

        if contributions == 0 {
            return None;
        }
        Some(accumulated / contributions)
    }

    /// Two-thirds approval: enough to pass a consensus change or release a
    /// claim against a fundraiser/bounty.
    pub fn is_approved(&self, is_local: bool) -> bool {
        matches!(self.consensus_ratio(is_local), Some(r) if r > PRECISION * 2 / 3)
    }

    /// Ninety-percent approval: required to redirect a parent poll's funds.
    pub fn is_fully_approved(&self, is_local: bool) -> bool {
        matches!(self.consensus_ratio(is_local), Some(r) if r > PRECISION * 90 / 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consensus_poll() -> Poll {
        Poll {
            id: 7,
            name: "upgrade".into(),
            question: "adopt the new reward schedule?".into(),
            flags: PollFlags(PollFlags::ENFORCE_POS),
            start: 10,
            end: 20,
            options: vec!["0".into(), "Approve".into(), "Disapprove".into()],
            tally: vec![Tally::default(); 3],
            address: "PXhZ8g2vXhD1vBbk6NS2rzyYkn3VE9qGv7".into(),
            hash: String::new(),
            height: 0,
        }
    }

    #[test]
    fn empty_tallies_split_evenly() {
        let poll = consensus_poll();
        assert_eq!(poll.consensus_ratio(true), Some(PRECISION / 2));
        assert!(!poll.is_approved(true));
    }

    #[test]
    fn approval_boundary_is_strict() {
        // An ENFORCE_POS poll averages the POS and donation columns (the
        // donation column rides on POS acceptance), so hold both at the
        // same ratio to probe the threshold.
        let mut poll = consensus_poll();
        // 2 approve / 1 disapprove is exactly 2/3: not approved.
        poll.tally[1].pos = 2;
        poll.tally[2].pos = 1;
        poll.tally[1].donation = 2;
        poll.tally[2].donation = 1;
        assert_eq!(poll.consensus_ratio(true), Some(PRECISION * 2 / 3));
        assert!(!poll.is_approved(true));

        // 3/4 clears the bar.
        poll.tally[1].pos = 3;
        poll.tally[1].donation = 3;
        assert!(poll.is_approved(true));
        assert!(!poll.is_fully_approved(true));

        poll.tally[1].pos = 91;
        poll.tally[2].pos = 9;
        poll.tally[1].donation = 91;
        poll.tally[2].donation = 9;
        assert!(poll.is_fully_approved(true));
    }

    #[test]
    fn donation_column_rides_on_pos_acceptance() {
        // FPOS+DONATION flags: the donation column does not contribute
        // because the poll does not accept POS votes, so only the FPOS
        // ratio counts.
        let mut poll = consensus_poll();
        poll.flags = PollFlags(PollFlags::ALLOW_FPOS | PollFlags::ALLOW_DONATION);
        poll.tally[1].fpos = 3;
        poll.tally[2].fpos = 1;
        poll.tally[1].donation = 0;
        poll.tally[2].donation = 100;
        assert_eq!(poll.consensus_ratio(true), Some(PRECISION * 3 / 4));
    }

    #[test]
    fn forced_flags_report_shapes() {
        let mut flags = PollFlags(PollFlags::CLAIM);
        assert!(flags.is_claim());
        assert!(flags.accepts_pos() && flags.accepts_fpos() && flags.accepts_pow());

        flags.unset_forced();
        assert!(!flags.is_claim());
        assert!(flags.accepts_pos() && flags.accepts_fpos() && flags.accepts_pow());

        let bounty = PollFlags(PollFlags::BOUNTY);
        assert!(bounty.is_bounty() && bounty.is_fund() && bounty.is_pay_to_poll());
    }

    #[test]
    fn incomplete_poll_has_no_ratio() {
        let mut poll = consensus_poll();
        poll.question = "why?".into();
        assert_eq!(poll.consensus_ratio(true), None);
    }
}
