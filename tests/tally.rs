use std::collections::BTreeMap;

use polls::{
    apply_ballots, apply_donation, pack_ballots, select_ballots, unpack_ballots, verify_ballots,
    Ballot, ChainSubmitter, ChainView, Poll, PollFlags, ProofType, Result, SledVoteDb, Tally,
    VoteIndex, WalletKeys, COIN,
};
use tempfile::tempdir;

const ANCHOR_TIME: i64 = 1_000_000_000;

struct TestChain;

impl ChainView for TestChain {
    fn best_height(&self) -> u64 {
        40_000
    }

    fn best_time(&self) -> i64 {
        ANCHOR_TIME + 500 * 3_600
    }

    fn time_at_height(&self, _height: u64) -> i64 {
        ANCHOR_TIME
    }
}

struct NoKeys;

impl WalletKeys for NoKeys {
    fn is_mine(&self, _address: &str) -> bool {
        false
    }
}

struct NoSubmit;

impl ChainSubmitter for NoSubmit {
    fn submit_poll_tx(&mut self, _raw_poll: &[u8]) -> Result<String> {
        Ok("unused".into())
    }
}

fn open_index(path: &std::path::Path) -> VoteIndex {
    let store = SledVoteDb::open(path).unwrap();
    VoteIndex::new(
        Box::new(store),
        Box::new(TestChain),
        Box::new(NoKeys),
        Box::new(NoSubmit),
        true,
    )
}

fn confirmed_poll(id: u32, flags: u8, start: u16, end: u16) -> Poll {
    Poll {
        id,
        name: format!("poll-{id}"),
        question: "which option should win?".into(),
        flags: PollFlags(flags),
        start,
        end,
        options: vec!["Red".into(), "Green".into(), "Blue".into()],
        tally: vec![Tally::default(); 3],
        address: "PXhZ8g2vXhD1vBbk6NS2rzyYkn3VE9qG".into(),
        hash: format!("hash-{id}"),
        height: 39_000,
    }
}

#[test]
fn apply_then_undo_restores_counters() {
    let dir = tempdir().unwrap();
    let mut index = open_index(&dir.path().join("votes.db"));
    index
        .commit(&confirmed_poll(10, PollFlags::ALLOW_POS, 100, 900), true)
        .unwrap();
    index
        .commit(&confirmed_poll(11, PollFlags::ALLOW_POS, 100, 900), true)
        .unwrap();

    let mut ballots = BTreeMap::new();
    ballots.insert(10, Ballot { poll_id: 10, selection: 1 });
    ballots.insert(11, Ballot { poll_id: 11, selection: 3 });

    apply_ballots(&mut index, &ballots, ProofType::Pos, false).unwrap();
    assert_eq!(index.confirmed()[&10].tally[0].pos, 1);
    assert_eq!(index.confirmed()[&11].tally[2].pos, 1);

    apply_ballots(&mut index, &ballots, ProofType::Pos, true).unwrap();
    assert_eq!(index.confirmed()[&10].tally[0].pos, 0);
    assert_eq!(index.confirmed()[&11].tally[2].pos, 0);

    // Undoing past zero saturates instead of wrapping.
    apply_ballots(&mut index, &ballots, ProofType::Pos, true).unwrap();
    assert_eq!(index.confirmed()[&10].tally[0].pos, 0);
}

#[test]
fn invalid_ballots_are_filtered_before_tallying() {
    let dir = tempdir().unwrap();
    let mut index = open_index(&dir.path().join("votes.db"));
    index
        .commit(&confirmed_poll(20, PollFlags::ALLOW_POS, 100, 900), true)
        .unwrap();

    let mut ballots = BTreeMap::new();
    ballots.insert(20, Ballot { poll_id: 20, selection: 2 });
    // Unknown poll, zero selection, out-of-range selection.
    ballots.insert(21, Ballot { poll_id: 21, selection: 1 });
    ballots.insert(20_000, Ballot { poll_id: 20_000, selection: 0 });

    let (valid, invalid) = verify_ballots(&index, &ballots, ProofType::Pos);
    assert_eq!(valid.len(), 1);
    assert_eq!(invalid.len(), 2);

    apply_ballots(&mut index, &ballots, ProofType::Pos, false).unwrap();
    let tally = &index.confirmed()[&20].tally;
    assert_eq!(tally[1].pos, 1);
    assert_eq!(tally[0].pos + tally[2].pos, 0);
}

#[test]
fn proof_type_gates_ballots() {
    let dir = tempdir().unwrap();
    let mut index = open_index(&dir.path().join("votes.db"));
    index
        .commit(&confirmed_poll(30, PollFlags::ALLOW_POW, 100, 900), true)
        .unwrap();

    let mut ballots = BTreeMap::new();
    ballots.insert(30, Ballot { poll_id: 30, selection: 1 });

    apply_ballots(&mut index, &ballots, ProofType::Pos, false).unwrap();
    assert_eq!(index.confirmed()[&30].tally[0].pos, 0);

    apply_ballots(&mut index, &ballots, ProofType::Pow, false).unwrap();
    assert_eq!(index.confirmed()[&30].tally[0].pow, 1);
}

#[test]
fn tallies_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("votes.db");
    let mut index = open_index(&path);
    index
        .commit(&confirmed_poll(40, PollFlags::ALLOW_POS, 100, 900), true)
        .unwrap();

    let mut ballots = BTreeMap::new();
    ballots.insert(40, Ballot { poll_id: 40, selection: 1 });
    apply_ballots(&mut index, &ballots, ProofType::Pos, false).unwrap();

    drop(index);
    let mut reopened = open_index(&path);
    reopened.load().unwrap();
    assert_eq!(reopened.confirmed()[&40].tally[0].pos, 1);
}

#[test]
fn donations_count_whole_coins() {
    let dir = tempdir().unwrap();
    let mut index = open_index(&dir.path().join("votes.db"));
    index
        .commit(
            &confirmed_poll(50, PollFlags::ALLOW_DONATION, 100, 900),
            true,
        )
        .unwrap();

    let ballot = Ballot { poll_id: 50, selection: 2 };
    assert!(apply_donation(&mut index, &ballot, 5 * COIN + COIN / 2, false).unwrap());
    assert_eq!(index.confirmed()[&50].tally[1].donation, 5);

    assert!(apply_donation(&mut index, &ballot, 2 * COIN, true).unwrap());
    assert_eq!(index.confirmed()[&50].tally[1].donation, 3);

    let stray = Ballot { poll_id: 51, selection: 1 };
    assert!(!apply_donation(&mut index, &stray, COIN, false).unwrap());

    let out_of_range = Ballot { poll_id: 50, selection: 9 };
    assert!(!apply_donation(&mut index, &out_of_range, COIN, false).unwrap());
}

#[test]
fn selection_skips_inactive_and_foreign_polls() {
    let dir = tempdir().unwrap();
    let mut index = open_index(&dir.path().join("votes.db"));

    // Active POS poll, an ended poll, and a POW-only poll.
    index
        .commit(&confirmed_poll(60, PollFlags::ALLOW_POS, 100, 900), true)
        .unwrap();
    index
        .commit(&confirmed_poll(61, PollFlags::ALLOW_POS, 100, 200), true)
        .unwrap();
    index
        .commit(&confirmed_poll(62, PollFlags::ALLOW_POW, 100, 900), true)
        .unwrap();

    index.cast(60, 1).unwrap();
    index.cast(61, 1).unwrap();
    index.cast(62, 2).unwrap();

    let payload = select_ballots(&index, ProofType::Pos, 0);
    let picked = unpack_ballots(&payload).unwrap();
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[&60].selection, 1);

    // Skipping past the only qualifying ballot yields nothing.
    let rest = select_ballots(&index, ProofType::Pos, index.ballots().len());
    assert!(rest.is_empty());
}

#[test]
fn pack_unpack_round_trip_matches_selection() {
    let ballots: Vec<Ballot> = (1..=37)
        .map(|i| Ballot {
            poll_id: i,
            selection: (i % 3 + 1) as u8,
        })
        .collect();
    let unpacked = unpack_ballots(&pack_ballots(&ballots)).unwrap();
    assert_eq!(unpacked.len(), 37);
    for b in &ballots {
        assert_eq!(unpacked[&b.poll_id], *b);
    }
}
