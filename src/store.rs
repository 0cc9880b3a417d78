//! Field-keyed poll persistence.
//!
//! Each poll record is exploded into one key per field (`name/123`,
//! `start/123`, `option2/123`, …) with a `Local` suffix marking the draft
//! copy (`nameLocal/123`). Tallies and chain coordinates exist only on the
//! canonical copy. Ballots occupy a single `ballotID` field per poll.

use std::collections::BTreeMap;

use crate::error::{PollError, Result};
use crate::poll::{Ballot, Poll, PollFlags, PollId, Tally, POLL_MAX_OPTIONS};

const LOCAL_SUFFIX: &str = "Local";

/// Everything a bulk load recovered, keyed by poll id.
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub confirmed: BTreeMap<PollId, Poll>,
    pub drafts: BTreeMap<PollId, Poll>,
    pub ballots: BTreeMap<PollId, Ballot>,
}

/// Narrow persistence seam for poll records.
///
/// The composed record operations are provided in terms of the three field
/// primitives, so alternative backends only implement those plus the bulk
/// scan.
pub trait VoteDb {
    fn write(&self, field: &str, id: PollId, value: &str) -> Result<()>;
    fn read(&self, field: &str, id: PollId) -> Result<Option<String>>;
    fn erase(&self, field: &str, id: PollId) -> Result<()>;
    fn load_all(&self) -> Result<LoadedRecords>;

    fn write_poll(&self, poll: &Poll, local: bool) -> Result<()> {
        let s = if local { LOCAL_SUFFIX } else { "" };
        self.write(&format!("name{s}"), poll.id, &poll.name)?;
        self.write(&format!("flags{s}"), poll.id, &poll.flags.bits().to_string())?;
        self.write(&format!("start{s}"), poll.id, &poll.start.to_string())?;
        self.write(&format!("end{s}"), poll.id, &poll.end.to_string())?;
        self.write(&format!("question{s}"), poll.id, &poll.question)?;
        self.write(&format!("address{s}"), poll.id, &poll.address)?;

        for slot in 1..=POLL_MAX_OPTIONS {
            match poll.options.get(slot - 1) {
                Some(option) => self.write(&format!("option{slot}{s}"), poll.id, option)?,
                None => self.erase(&format!("option{slot}{s}"), poll.id)?,
            }
        }

        if !local {
            for slot in 1..=POLL_MAX_OPTIONS {
                match poll.tally.get(slot - 1) {
                    Some(t) => {
                        self.write(&format!("tPOS{slot}"), poll.id, &t.pos.to_string())?;
                        self.write(&format!("tFPOS{slot}"), poll.id, &t.fpos.to_string())?;
                        self.write(&format!("tPOW{slot}"), poll.id, &t.pow.to_string())?;
                        self.write(&format!("tD4L{slot}"), poll.id, &t.donation.to_string())?;
                    }
                    None => {
                        self.erase(&format!("tPOS{slot}"), poll.id)?;
                        self.erase(&format!("tFPOS{slot}"), poll.id)?;
                        self.erase(&format!("tPOW{slot}"), poll.id)?;
                        self.erase(&format!("tD4L{slot}"), poll.id)?;
                    }
                }
            }
            self.write("txhash", poll.id, &poll.hash)?;
            self.write("height", poll.id, &poll.height.to_string())?;
        }
        Ok(())
    }

    fn erase_poll(&self, id: PollId, local: bool) -> Result<()> {
        let s = if local { LOCAL_SUFFIX } else { "" };
        for field in ["name", "flags", "start", "end", "question", "address"] {
            self.erase(&format!("{field}{s}"), id)?;
        }
        for slot in 1..=POLL_MAX_OPTIONS {
            self.erase(&format!("option{slot}{s}"), id)?;
            if !local {
                self.erase(&format!("tPOS{slot}"), id)?;
                self.erase(&format!("tFPOS{slot}"), id)?;
                self.erase(&format!("tPOW{slot}"), id)?;
                self.erase(&format!("tD4L{slot}"), id)?;
            }
        }
        if !local {
            self.erase("txhash", id)?;
            self.erase("height", id)?;
        }
        Ok(())
    }

    fn write_ballot(&self, ballot: &Ballot) -> Result<()> {
        self.write("ballotID", ballot.poll_id, &ballot.selection.to_string())
    }

    fn erase_ballot(&self, id: PollId) -> Result<()> {
        self.erase("ballotID", id)
    }
}

/// Sled-backed store; one tree, `field/id` keys, string values.
pub struct SledVoteDb {
    tree: sled::Tree,
    _db: sled::Db,
}

impl SledVoteDb {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::Config::new().path(path).open()?;
        let tree = db.open_tree("polls")?;
        Ok(Self { tree, _db: db })
    }
}

fn key(field: &str, id: PollId) -> String {
    format!("{field}/{id}")
}

impl VoteDb for SledVoteDb {
    fn write(&self, field: &str, id: PollId, value: &str) -> Result<()> {
        self.tree.insert(key(field, id), value.as_bytes())?;
        Ok(())
    }

    fn read(&self, field: &str, id: PollId) -> Result<Option<String>> {
        let value = self.tree.get(key(field, id))?;
        Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    fn erase(&self, field: &str, id: PollId) -> Result<()> {
        self.tree.remove(key(field, id))?;
        Ok(())
    }

    fn load_all(&self) -> Result<LoadedRecords> {
        let mut out = LoadedRecords::default();
        for entry in self.tree.iter() {
            let (raw_key, raw_value) =
                entry.map_err(|e| PollError::Corrupt(format!("store cursor failed: {e}")))?;

            let Ok(key) = std::str::from_utf8(&raw_key) else {
                log::warn!("skipping poll record with non-utf8 key");
                continue;
            };
            let value = String::from_utf8_lossy(&raw_value).into_owned();
            let Some((field, id)) = key.split_once('/') else {
                log::warn!("skipping malformed poll record key {key:?}");
                continue;
            };
            let Ok(id) = id.parse::<PollId>() else {
                log::warn!("skipping poll record with bad id in key {key:?}");
                continue;
            };
            // Id 0 is the registry's reserved blank entry and is never
            // written; a stored record claiming it is corrupt.
            if id == 0 {
                log::warn!("skipping poll record with reserved id in key {key:?}");
                continue;
            }

            if let Err(reason) = apply_field(&mut out, field, id, &value) {
                log::warn!("skipping unreadable poll record {key:?}: {reason}");
            }
        }
        Ok(out)
    }
}

fn ensure_slot(poll: &mut Poll, slot: usize) {
    if poll.options.len() < slot {
        poll.options.resize(slot, String::new());
    }
    if poll.tally.len() < slot {
        poll.tally.resize(slot, Tally::default());
    }
}

fn parse<T: std::str::FromStr>(value: &str, what: &str) -> std::result::Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("{what} field held {value:?}"))
}

enum FieldValue {
    Name(String),
    Question(String),
    Address(String),
    Flags(PollFlags),
    Start(u16),
    End(u16),
    TxHash(String),
    Height(u64),
    Option(usize, String),
    TallyCount(&'static str, usize, u32),
}

/// Parse a field record fully before touching the maps so an unreadable
/// record never leaves a half-built poll behind.
fn parse_field(
    field: &str,
    local: bool,
    value: &str,
) -> std::result::Result<FieldValue, String> {
    Ok(match field {
        "name" => FieldValue::Name(value.to_string()),
        "question" => FieldValue::Question(value.to_string()),
        "address" => FieldValue::Address(value.to_string()),
        "flags" => FieldValue::Flags(PollFlags(parse(value, "flags")?)),
        "start" => FieldValue::Start(parse(value, "start")?),
        "end" => FieldValue::End(parse(value, "end")?),
        "txhash" if !local => FieldValue::TxHash(value.to_string()),
        "height" if !local => FieldValue::Height(parse(value, "height")?),
        _ => {
            if let Some(slot) = field.strip_prefix("option") {
                let slot: usize = parse(slot, "option slot")?;
                if slot == 0 || slot > POLL_MAX_OPTIONS {
                    return Err(format!("option slot {slot} out of range"));
                }
                FieldValue::Option(slot, value.to_string())
            } else if let Some((column, slot)) = ["tPOS", "tFPOS", "tPOW", "tD4L"]
                .iter()
                .find_map(|c| field.strip_prefix(c).map(|rest| (*c, rest)))
            {
                if local {
                    return Err(format!("tally column {column} on a draft record"));
                }
                let slot: usize = parse(slot, "tally slot")?;
                if slot == 0 || slot > POLL_MAX_OPTIONS {
                    return Err(format!("tally slot {slot} out of range"));
                }
                FieldValue::TallyCount(column, slot, parse(value, "tally count")?)
            } else {
                return Err(format!("unknown field {field:?}"));
            }
        }
    })
}

fn apply_field(
    out: &mut LoadedRecords,
    field: &str,
    id: PollId,
    value: &str,
) -> std::result::Result<(), String> {
    if field == "ballotID" {
        let ballot = Ballot {
            poll_id: id,
            selection: parse(value, "ballot selection")?,
        };
        out.ballots.insert(id, ballot);
        return Ok(());
    }

    let (field, local) = match field.strip_suffix(LOCAL_SUFFIX) {
        Some(base) => (base, true),
        None => (field, false),
    };
    let parsed = parse_field(field, local, value)?;

    let stack = if local {
        &mut out.drafts
    } else {
        &mut out.confirmed
    };
    let poll = stack.entry(id).or_insert_with(|| Poll {
        id,
        ..Poll::default()
    });

    match parsed {
        FieldValue::Name(v) => poll.name = v,
        FieldValue::Question(v) => poll.question = v,
        FieldValue::Address(v) => poll.address = v,
        FieldValue::Flags(v) => poll.flags = v,
        FieldValue::Start(v) => poll.start = v,
        FieldValue::End(v) => poll.end = v,
        FieldValue::TxHash(v) => poll.hash = v,
        FieldValue::Height(v) => poll.height = v,
        FieldValue::Option(slot, v) => {
            ensure_slot(poll, slot);
            poll.options[slot - 1] = v;
        }
        FieldValue::TallyCount(column, slot, count) => {
            ensure_slot(poll, slot);
            let tally = &mut poll.tally[slot - 1];
            match column {
                "tPOS" => tally.pos = count,
                "tFPOS" => tally.fpos = count,
                "tPOW" => tally.pow = count,
                _ => tally.donation = count,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn poll_record_round_trips_through_fields() {
        let dir = tempdir().unwrap();
        let db = SledVoteDb::open(dir.path().join("votes.db")).unwrap();

        let poll = Poll {
            id: 42,
            name: "relay".into(),
            question: "fund the relay?".into(),
            flags: PollFlags(PollFlags::ALLOW_POS),
            start: 5,
            end: 50,
            options: vec!["Yes".into(), "No".into()],
            tally: vec![
                Tally {
                    pos: 3,
                    ..Tally::default()
                },
                Tally::default(),
            ],
            address: "PXhZ8g2vXhD1vBbk6NS2rzyYkn3VE9qG".into(),
            hash: "ab".repeat(32),
            height: 900,
        };
        db.write_poll(&poll, false).unwrap();
        db.write_ballot(&Ballot {
            poll_id: 42,
            selection: 1,
        })
        .unwrap();

        let records = db.load_all().unwrap();
        assert_eq!(records.confirmed.get(&42), Some(&poll));
        assert_eq!(records.ballots[&42].selection, 1);
        assert!(records.drafts.is_empty());
    }

    #[test]
    fn local_and_canonical_copies_are_distinct() {
        let dir = tempdir().unwrap();
        let db = SledVoteDb::open(dir.path().join("votes.db")).unwrap();

        let mut poll = Poll {
            id: 9,
            name: "draft".into(),
            ..Poll::default()
        };
        db.write_poll(&poll, true).unwrap();
        poll.name = "canonical".into();
        db.write_poll(&poll, false).unwrap();

        let records = db.load_all().unwrap();
        assert_eq!(records.drafts[&9].name, "draft");
        assert_eq!(records.confirmed[&9].name, "canonical");

        db.erase_poll(9, true).unwrap();
        let records = db.load_all().unwrap();
        assert!(records.drafts.is_empty());
        assert_eq!(records.confirmed[&9].name, "canonical");
    }

    #[test]
    fn bad_records_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let db = SledVoteDb::open(dir.path().join("votes.db")).unwrap();

        let poll = Poll {
            id: 3,
            name: "ok".into(),
            ..Poll::default()
        };
        db.write_poll(&poll, true).unwrap();
        // Plant records that cannot parse, plus one under the reserved id.
        db.write("flagsLocal", 4, "not-a-number").unwrap();
        db.write("mystery", 5, "??").unwrap();
        db.write("name", 0, "ghost").unwrap();

        let records = db.load_all().unwrap();
        assert_eq!(records.drafts[&3].name, "ok");
        // Unreadable records never materialize a poll.
        assert!(!records.drafts.contains_key(&4));
        assert!(!records.confirmed.contains_key(&5));
        // Id 0 belongs to the registry's blank entry, never to the store.
        assert!(!records.confirmed.contains_key(&0));
    }
}
