//! The in-memory poll registry and its lifecycle operations.
//!
//! `VoteIndex` holds three ordered maps (confirmed polls seen on chain,
//! local drafts, and this wallet's ballots) plus an id-based cursor naming
//! the poll/ballot pair currently being worked on. Every map keeps a
//! sentinel entry under id 0 so the cursor always resolves. Persistence
//! writes happen before the matching in-memory mutation; a failed write
//! leaves the maps untouched.

use std::collections::BTreeMap;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::codec;
use crate::error::{invalid, PollError, Result};
use crate::poll::{Ballot, Poll, PollId, PollTime};
use crate::store::VoteDb;
use crate::timing::{self, ChainView};

/// Hours a claim poll must wait before it may open.
const CLAIM_LEAD_HOURS: PollTime = 24 * 7;
/// Minimum hours a claim poll must stay open.
const CLAIM_WINDOW_HOURS: PollTime = 24 * 14;

/// Wallet key ownership checks.
pub trait WalletKeys {
    fn is_mine(&self, address: &str) -> bool;
}

/// Hands an encoded poll to the chain for inclusion in a transaction.
pub trait ChainSubmitter {
    /// Returns the transaction hash the poll was carried in.
    fn submit_poll_tx(&mut self, raw_poll: &[u8]) -> Result<String>;
}

/// Cursor flags for [`ActiveCursor::bind`].
pub const SET_CLEAR: u8 = 0;
pub const SET_POLL: u8 = 1 << 0;
pub const SET_BALLOT: u8 = 1 << 1;

/// The currently selected poll/ballot pair, held by id so map mutations
/// can never leave it dangling. Id 0 names the sentinels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActiveCursor {
    pub poll_id: PollId,
    pub ballot_id: PollId,
}

impl ActiveCursor {
    fn bind(&mut self, poll_id: PollId, ballot_id: PollId, flags: u8) {
        if flags & SET_POLL != 0 {
            self.poll_id = poll_id;
        }
        if flags & SET_BALLOT != 0 {
            self.ballot_id = ballot_id;
        }
        if flags == SET_CLEAR {
            self.poll_id = 0;
            self.ballot_id = 0;
        }
    }
}

/// The poll registry.
pub struct VoteIndex {
    confirmed: BTreeMap<PollId, Poll>,
    drafts: BTreeMap<PollId, Poll>,
    ballots: BTreeMap<PollId, Ballot>,
    cursor: ActiveCursor,
    ready: bool,
    /// Relaxes claim-poll lead/window requirements for test networks.
    relaxed_timing: bool,
    store: Box<dyn VoteDb>,
    chain: Box<dyn ChainView>,
    keys: Box<dyn WalletKeys>,
    submitter: Box<dyn ChainSubmitter>,
}

impl VoteIndex {
    pub fn new(
        store: Box<dyn VoteDb>,
        chain: Box<dyn ChainView>,
        keys: Box<dyn WalletKeys>,
        submitter: Box<dyn ChainSubmitter>,
        relaxed_timing: bool,
    ) -> Self {
        let mut index = Self {
            confirmed: BTreeMap::new(),
            drafts: BTreeMap::new(),
            ballots: BTreeMap::new(),
            cursor: ActiveCursor::default(),
            ready: false,
            relaxed_timing,
            store,
            chain,
            keys,
            submitter,
        };
        index.reset_sentinels();
        index
    }

    fn reset_sentinels(&mut self) {
        self.confirmed.entry(0).or_insert_with(Poll::default);
        self.drafts.entry(0).or_insert_with(Poll::default);
        self.ballots.entry(0).or_insert_with(|| Ballot::new(0));
    }

    pub fn confirmed(&self) -> &BTreeMap<PollId, Poll> {
        &self.confirmed
    }

    pub fn drafts(&self) -> &BTreeMap<PollId, Poll> {
        &self.drafts
    }

    pub fn ballots(&self) -> &BTreeMap<PollId, Ballot> {
        &self.ballots
    }

    pub fn cursor(&self) -> ActiveCursor {
        self.cursor
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// The compact poll clock at the chain tip.
    pub fn now(&self) -> PollTime {
        timing::to_poll_time(self.chain.as_ref(), self.chain.best_time())
    }

    pub fn chain(&self) -> &dyn ChainView {
        self.chain.as_ref()
    }

    /// A poll is local while the confirmed set does not know its id.
    pub fn is_local(&self, id: PollId) -> bool {
        id != 0 && !self.confirmed.contains_key(&id)
    }

    /// Local drafts are ours by construction; confirmed polls are ours when
    /// the wallet holds the key for their address.
    pub fn is_mine(&self, poll: &Poll) -> bool {
        self.keys.is_mine(&poll.address) || self.is_local(poll.id)
    }

    /// The poll the cursor names: drafts shadow the confirmed copy.
    pub fn active_poll(&self) -> &Poll {
        self.drafts
            .get(&self.cursor.poll_id)
            .or_else(|| self.confirmed.get(&self.cursor.poll_id))
            .unwrap_or_else(|| &self.drafts[&0])
    }

    pub fn active_ballot(&self) -> &Ballot {
        self.ballots
            .get(&self.cursor.ballot_id)
            .unwrap_or_else(|| &self.ballots[&0])
    }

    /// Mutate the active draft and persist it. Fails when the cursor names
    /// the sentinel.
    pub fn edit_active_poll(&mut self, edit: impl FnOnce(&mut Poll)) -> Result<()> {
        let id = self.cursor.poll_id;
        if id == 0 {
            return Err(invalid("no active poll selected"));
        }
        let Some(poll) = self.drafts.get(&id) else {
            return Err(invalid("active poll is not an editable draft"));
        };
        let mut updated = poll.clone();
        edit(&mut updated);
        updated.id = id;
        updated.sync_tally();
        self.store.write_poll(&updated, true)?;
        self.drafts.insert(id, updated);
        self.ready = false;
        Ok(())
    }

    /// Set the active ballot's selection and persist it.
    pub fn make_selection(&mut self, selection: u8) -> Result<()> {
        let id = self.cursor.ballot_id;
        if id == 0 {
            return Err(invalid("no active ballot selected"));
        }
        let options = self.active_poll().options.len();
        if usize::from(selection) > options {
            return Err(invalid(format!(
                "selection {selection} out of range, poll has {options} options"
            )));
        }
        let ballot = Ballot {
            poll_id: id,
            selection,
        };
        self.store.write_ballot(&ballot)?;
        self.ballots.insert(id, ballot);
        Ok(())
    }

    /// Record a ballot for any confirmed poll (not just the cursor's).
    pub fn cast(&mut self, poll_id: PollId, selection: u8) -> Result<()> {
        let Some(poll) = self.confirmed.get(&poll_id) else {
            return Err(invalid(format!("unknown poll {poll_id}")));
        };
        if selection == 0 || usize::from(selection) > poll.options.len() {
            return Err(invalid(format!("selection {selection} out of range")));
        }
        let ballot = Ballot { poll_id, selection };
        self.store.write_ballot(&ballot)?;
        self.ballots.insert(poll_id, ballot);
        Ok(())
    }

    /// Apply a closure to a confirmed poll and persist the result.
    pub(crate) fn with_confirmed_poll(
        &mut self,
        id: PollId,
        apply: impl FnOnce(&mut Poll),
    ) -> Result<()> {
        let Some(poll) = self.confirmed.get(&id) else {
            return Err(invalid(format!("unknown poll {id}")));
        };
        let mut updated = poll.clone();
        apply(&mut updated);
        self.store.write_poll(&updated, false)?;
        self.confirmed.insert(id, updated);
        Ok(())
    }

    fn fresh_id(&self) -> PollId {
        let mut id = 0;
        while id == 0 || self.drafts.contains_key(&id) || self.confirmed.contains_key(&id) {
            id = OsRng.next_u32();
        }
        id
    }

    /// Register a new draft poll. The incoming record must not carry an id;
    /// a free random one is assigned, a zero ballot is created alongside,
    /// and the cursor moves to the pair.
    pub fn new_poll(&mut self, mut poll: Poll) -> Result<PollId> {
        if poll.id != 0 {
            return Err(invalid("new poll already has an id set"));
        }
        poll.id = self.fresh_id();
        poll.sync_tally();
        let id = poll.id;

        // A ballot under a freshly rolled id can only be a stray.
        if self.ballots.contains_key(&id) {
            self.store.erase_ballot(id)?;
            self.ballots.remove(&id);
        }

        let ballot = Ballot::new(id);
        self.store.write_poll(&poll, true)?;
        self.store.write_ballot(&ballot)?;
        self.drafts.insert(id, poll);
        self.ballots.insert(id, ballot);
        self.cursor.bind(id, id, SET_POLL | SET_BALLOT);
        self.ready = false;
        Ok(id)
    }

    /// Point the cursor at a poll, copying a confirmed poll into the draft
    /// stack first so it can be edited. Returns false for unknown ids.
    pub fn set_active(&mut self, id: PollId) -> Result<bool> {
        if id == 0 {
            return Ok(false);
        }
        if !self.drafts.contains_key(&id) {
            let Some(poll) = self.confirmed.get(&id) else {
                return Ok(false);
            };
            let copy = poll.clone();
            self.store.write_poll(&copy, true)?;
            self.drafts.insert(id, copy);
        }
        self.cursor.bind(id, 0, SET_POLL);
        self.ready = false;

        if !self.ballots.contains_key(&id) {
            let ballot = Ballot::new(id);
            self.store.write_ballot(&ballot)?;
            self.ballots.insert(id, ballot);
        }
        self.cursor.bind(0, id, SET_BALLOT);
        Ok(true)
    }

    /// Check a poll against submission rules and remember the verdict in
    /// the ready flag. Chain-sourced polls only need structural checks.
    pub fn validate(&mut self, poll: &Poll, from_chain: bool) -> bool {
        if from_chain {
            self.ready = poll.is_complete(self.is_local(poll.id));
            return self.ready;
        }

        let now = self.now();
        let mut ok = self.is_local(poll.id);
        ok &= poll.start > now;
        ok &= poll.start < poll.end;
        ok &= !poll.name.is_empty();
        ok &= !poll.question.is_empty();
        ok &= !poll.address.is_empty();
        ok &= !poll.options.is_empty();

        if poll.flags.is_claim() && !self.relaxed_timing {
            ok &= poll.start >= now.saturating_add(CLAIM_LEAD_HOURS);
            ok &= poll.end.saturating_sub(poll.start) >= CLAIM_WINDOW_HOURS;
            // Only a named parent that is actually on chain constrains the
            // claim; a blank or unknown parent slot is not an error here.
            if let Some(parent) = poll.parent_id().and_then(|p| self.confirmed.get(&p)) {
                ok &= parent.has_ended(now);
            }
        }

        self.ready = ok;
        ok
    }

    /// Commit a poll. Chain-sourced polls enter the confirmed set (handling
    /// id collisions against drafts); local polls are encoded and handed to
    /// the chain submitter. Returns the transaction hash.
    pub fn commit(&mut self, poll: &Poll, from_chain: bool) -> Result<String> {
        if !from_chain {
            if !self.ready {
                return Err(invalid("poll has not passed validation"));
            }
            let raw = codec::encode(poll)?;
            let hash = self.submitter.submit_poll_tx(&raw)?;
            if hash.is_empty() {
                return Err(PollError::Submit("chain returned no transaction hash".into()));
            }
            return Ok(hash);
        }

        match self.confirmed.get(&poll.id) {
            None => {
                self.store.write_poll(poll, false)?;
                self.confirmed.insert(poll.id, poll.clone());
            }
            // The chain never reassigns an id; a divergent replay is the
            // caller's bug, not a record to overwrite.
            Some(existing) if !existing.matches(poll) => {
                return Err(PollError::IdCollision(poll.id));
            }
            Some(_) => {}
        }

        // A draft squatting on the same id with different content loses the
        // id; the chain's copy is authoritative.
        if let Some(draft) = self.drafts.get(&poll.id) {
            if !draft.matches(poll) && draft.id != 0 {
                self.rekey_draft(poll.id)?;
            }
        }
        Ok(poll.hash.clone())
    }

    /// Move a draft (and its ballot) to a fresh id after a chain collision.
    fn rekey_draft(&mut self, old_id: PollId) -> Result<()> {
        let new_id = self.fresh_id();
        let Some(mut draft) = self.drafts.get(&old_id).cloned() else {
            return Ok(());
        };
        draft.id = new_id;
        let ballot = Ballot {
            poll_id: new_id,
            selection: self
                .ballots
                .get(&old_id)
                .map(|b| b.selection)
                .unwrap_or(0),
        };

        self.store.erase_poll(old_id, true)?;
        self.store.erase_ballot(old_id)?;
        self.store.write_poll(&draft, true)?;
        self.store.write_ballot(&ballot)?;

        self.drafts.remove(&old_id);
        self.ballots.remove(&old_id);
        self.drafts.insert(new_id, draft);
        self.ballots.insert(new_id, ballot);

        if self.cursor.poll_id == old_id {
            self.cursor.bind(new_id, 0, SET_POLL);
        }
        if self.cursor.ballot_id == old_id {
            self.cursor.bind(0, new_id, SET_BALLOT);
        }
        log::info!("draft poll {old_id} collided with a chain poll, re-keyed to {new_id}");
        Ok(())
    }

    /// Validate the active draft and submit it to the chain.
    pub fn submit_active(&mut self) -> Result<String> {
        let poll = self.active_poll().clone();
        if poll.id == 0 {
            return Err(invalid("no active poll selected"));
        }
        if !self.validate(&poll, false) {
            return Err(invalid("active poll failed validation"));
        }
        self.commit(&poll, false)
    }

    /// Decode a wire poll and, when it came from a block, validate and
    /// commit it under the block's chain coordinates. `check_only` stops
    /// after the structural decode.
    pub fn process_raw_poll(
        &mut self,
        raw: &[u8],
        hash: &str,
        height: u64,
        check_only: bool,
        from_chain: bool,
    ) -> Result<bool> {
        let mut poll = codec::decode(raw)?;

        if self.confirmed.contains_key(&poll.id) {
            log::debug!("ignoring duplicate wire poll {}", poll.id);
            return Ok(false);
        }
        if check_only {
            return Ok(true);
        }

        poll.hash = hash.to_string();
        poll.height = height;

        let ok = self.validate(&poll, from_chain);
        if ok && from_chain {
            self.commit(&poll, true)?;
        }
        Ok(ok)
    }

    /// Drop every trace of a poll: draft, ballot and confirmed record. The
    /// cursor is re-pointed at the sentinel first so it never dangles.
    pub fn remove_poll(&mut self, id: PollId) -> Result<()> {
        if id == 0 {
            return Err(invalid("cannot remove the sentinel poll"));
        }
        if self.cursor.poll_id == id || self.cursor.ballot_id == id {
            self.cursor.bind(0, 0, SET_CLEAR);
        }

        if self.drafts.contains_key(&id) {
            self.store.erase_poll(id, true)?;
            self.drafts.remove(&id);
        }
        if self.ballots.contains_key(&id) {
            self.store.erase_ballot(id)?;
            self.ballots.remove(&id);
        }
        if self.confirmed.contains_key(&id) {
            self.store.erase_poll(id, false)?;
            self.confirmed.remove(&id);
        }
        Ok(())
    }

    /// Remove the poll whose confirming transaction was disconnected.
    pub fn remove_poll_by_hash(&mut self, hash: &str) -> Result<()> {
        let ids: Vec<PollId> = self
            .confirmed
            .iter()
            .filter(|(id, poll)| **id != 0 && poll.hash == hash)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.remove_poll(id)?;
        }
        Ok(())
    }

    /// Replace the in-memory maps with the stored records. Drafts that
    /// shadow a confirmed poll inherit its chain coordinates and tallies so
    /// an edit session always starts from chain truth.
    pub fn load(&mut self) -> Result<()> {
        let records = self.store.load_all()?;
        self.confirmed = records.confirmed;
        self.drafts = records.drafts;
        self.ballots = records.ballots;
        // Id 0 is the registry's blank entry; a store must never supply it.
        self.confirmed.remove(&0);
        self.drafts.remove(&0);
        self.ballots.remove(&0);
        self.reset_sentinels();

        let shadowed: Vec<PollId> = self
            .drafts
            .keys()
            .copied()
            .filter(|id| *id != 0 && self.confirmed.contains_key(id))
            .collect();
        for id in shadowed {
            let canonical = &self.confirmed[&id];
            let (hash, height, address, tally) = (
                canonical.hash.clone(),
                canonical.height,
                canonical.address.clone(),
                canonical.tally.clone(),
            );
            if let Some(draft) = self.drafts.get_mut(&id) {
                draft.hash = hash;
                draft.height = height;
                draft.address = address;
                draft.tally = tally;
            }
        }

        self.cursor.bind(0, 0, SET_CLEAR);
        self.ready = false;
        log::info!(
            "loaded {} confirmed polls, {} drafts, {} ballots",
            self.confirmed.len() - 1,
            self.drafts.len() - 1,
            self.ballots.len() - 1,
        );
        Ok(())
    }
}
