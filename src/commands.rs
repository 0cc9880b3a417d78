//! Verb-per-function command surface over the registry.
//!
//! The embedding RPC/CLI layer parses its own argument syntax and calls
//! [`dispatch`]; replies are JSON values and every failure is a typed error
//! with a human-readable reason.

use serde_json::{json, Value};

use crate::error::{invalid, Result};
use crate::poll::{Ballot, Poll, PollFlags, PollId, POLL_MAX_OPTIONS};
use crate::registry::VoteIndex;

/// Polls per page in the listing verbs.
const PAGE_SIZE: usize = 10;

/// Route a command verb to its handler.
pub fn dispatch(index: &mut VoteIndex, verb: &str, args: &[String]) -> Result<Value> {
    match verb {
        "newpoll" => new_poll(index),
        "setactive" | "add" => set_active(index, args),
        "pollname" => poll_name(index, args),
        "pollquestion" => poll_question(index, args),
        "pollstart" => poll_start(index, args),
        "pollend" => poll_end(index, args),
        "setflag" => set_flag(index, args),
        "unsetflag" => unset_flag(index, args),
        "addoption" => add_option(index, args),
        "removeoption" => remove_option(index, args),
        "address" | "fundaddress" | "claimaddress" | "bountyaddress" => set_address(index, args),
        "claimpoll" => claim_poll(index, args),
        "makeselection" => make_selection(index, args),
        "cast" => cast(index, args),
        "confirm" => confirm(index),
        "submitpoll" => submit_poll(index),
        "pollinfo" => poll_info(index, args),
        "ballotinfo" => ballot_info(index),
        "tally" => tally(index, args),
        "getactive" => get_active(index),
        "listactive" => list_polls(index, args, ListKind::Active),
        "listcomplete" => list_polls(index, args, ListKind::Complete),
        "listupcoming" => list_polls(index, args, ListKind::Upcoming),
        "listlocal" => list_local(index, args),
        "searchname" => search(index, args, SearchField::Name),
        "searchquestion" => search(index, args, SearchField::Question),
        "remove" => remove(index, args),
        other => Err(invalid(format!("unknown poll command {other:?}"))),
    }
}

fn arg<'a>(args: &'a [String], pos: usize, what: &str) -> Result<&'a str> {
    args.get(pos)
        .map(String::as_str)
        .ok_or_else(|| invalid(format!("missing argument: {what}")))
}

fn parse_arg<T: std::str::FromStr>(args: &[String], pos: usize, what: &str) -> Result<T> {
    arg(args, pos, what)?
        .parse::<T>()
        .map_err(|_| invalid(format!("argument {what} did not parse")))
}

fn poll_json(index: &VoteIndex, poll: &Poll) -> Value {
    json!({
        "id": poll.id,
        "name": poll.name,
        "question": poll.question,
        "flags": poll.flags.bits(),
        "start": poll.start,
        "end": poll.end,
        "options": poll.options,
        "address": poll.address,
        "txhash": poll.hash,
        "height": poll.height,
        "local": index.is_local(poll.id),
        "active": poll.is_active(index.now()),
    })
}

fn ballot_json(ballot: &Ballot) -> Value {
    json!({ "poll": ballot.poll_id, "selection": ballot.selection })
}

fn new_poll(index: &mut VoteIndex) -> Result<Value> {
    let id = index.new_poll(Poll::default())?;
    Ok(json!({ "id": id }))
}

fn set_active(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let id: PollId = parse_arg(args, 0, "poll id")?;
    if !index.set_active(id)? {
        return Err(invalid(format!("unknown poll {id}")));
    }
    Ok(json!({ "active": id }))
}

fn poll_name(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let name = arg(args, 0, "poll name")?.to_string();
    index.edit_active_poll(|poll| poll.name = name)?;
    Ok(json!({ "name": index.active_poll().name }))
}

fn poll_question(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let question = arg(args, 0, "poll question")?.to_string();
    index.edit_active_poll(|poll| poll.question = question)?;
    Ok(json!({ "question": index.active_poll().question }))
}

fn poll_start(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let start = parse_arg(args, 0, "start poll-time")?;
    index.edit_active_poll(|poll| poll.start = start)?;
    Ok(json!({ "start": start }))
}

fn poll_end(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let end = parse_arg(args, 0, "end poll-time")?;
    index.edit_active_poll(|poll| poll.end = end)?;
    Ok(json!({ "end": end }))
}

fn flag_mask(token: &str) -> Result<u8> {
    Ok(match token {
        "ENFORCE_POS" => PollFlags::ENFORCE_POS,
        "POS" => PollFlags::ALLOW_POS,
        "FPOS" => PollFlags::ALLOW_FPOS,
        "POW" => PollFlags::ALLOW_POW,
        "DONATION" => PollFlags::ALLOW_DONATION,
        "P2POLL" => PollFlags::PAY_TO_POLL,
        "FUNDRAISER" => PollFlags::FUNDRAISER,
        "BOUNTY" => PollFlags::BOUNTY,
        "CLAIM" => PollFlags::CLAIM,
        other => return Err(invalid(format!("unknown poll flag {other:?}"))),
    })
}

/// The canonical option shape a claim poll is pinned to; slot 0 holds the
/// parent poll id.
fn claim_options() -> Vec<String> {
    vec!["0".into(), "Approve".into(), "Disapprove".into()]
}

fn set_flag(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let token = arg(args, 0, "flag")?;
    let mask = flag_mask(token)?;
    index.edit_active_poll(|poll| match token {
        "ENFORCE_POS" => poll.flags = PollFlags(PollFlags::ENFORCE_POS),
        "CLAIM" => {
            poll.flags = PollFlags(PollFlags::CLAIM);
            poll.options = claim_options();
        }
        // Forced shapes take over the whole flag byte and the option list.
        "BOUNTY" | "FUNDRAISER" => {
            poll.flags = PollFlags(mask);
            poll.options.clear();
        }
        // A plain vote-type flag returns the poll to a custom shape; the
        // forced bits go, the vote-type bits stay.
        _ => {
            poll.flags.insert(mask);
            poll.flags
                .remove(PollFlags::FUNDRAISER | PollFlags::BOUNTY_BIT | PollFlags::CLAIM_BIT);
        }
    })?;
    Ok(json!({ "flags": index.active_poll().flags.bits() }))
}

fn unset_flag(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let token = arg(args, 0, "flag")?;
    let mask = flag_mask(token)?;
    if token == "ENFORCE_POS" {
        return Err(invalid("ENFORCE_POS is the empty flag set, nothing to unset"));
    }
    let forced = matches!(token, "CLAIM" | "BOUNTY" | "FUNDRAISER");
    index.edit_active_poll(|poll| {
        if forced {
            poll.flags.unset_forced();
        } else {
            poll.flags.remove(mask);
        }
    })?;
    Ok(json!({ "flags": index.active_poll().flags.bits() }))
}

fn add_option(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let option = arg(args, 0, "option text")?.to_string();
    let poll = index.active_poll();
    if poll.flags.is_claim() {
        return Err(invalid("claim polls carry a fixed option list"));
    }
    if poll.options.len() >= POLL_MAX_OPTIONS {
        return Err(invalid(format!("polls carry at most {POLL_MAX_OPTIONS} options")));
    }
    index.edit_active_poll(|poll| poll.options.push(option))?;
    Ok(json!({ "options": index.active_poll().options }))
}

fn remove_option(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let slot: usize = parse_arg(args, 0, "option slot")?;
    let count = index.active_poll().options.len();
    if slot == 0 || slot > count {
        return Err(invalid(format!("option slot {slot} out of range")));
    }
    index.edit_active_poll(|poll| {
        poll.options.remove(slot - 1);
    })?;
    // The old selection may now point at a different option.
    if index.cursor().ballot_id != 0 {
        index.make_selection(0)?;
    }
    Ok(json!({ "options": index.active_poll().options }))
}

fn set_address(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let address = arg(args, 0, "address")?.to_string();
    index.edit_active_poll(|poll| poll.address = address)?;
    Ok(json!({ "address": index.active_poll().address }))
}

fn claim_poll(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let parent: PollId = parse_arg(args, 0, "parent poll id")?;
    if !index.active_poll().flags.is_claim() {
        return Err(invalid("active poll is not a claim poll"));
    }
    if !index.confirmed().contains_key(&parent) {
        return Err(invalid(format!("unknown parent poll {parent}")));
    }
    index.edit_active_poll(|poll| {
        if poll.options.is_empty() {
            poll.options = claim_options();
        }
        poll.options[0] = parent.to_string();
    })?;
    Ok(json!({ "parent": parent }))
}

fn make_selection(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let selection: u8 = parse_arg(args, 0, "selection")?;
    index.make_selection(selection)?;
    Ok(ballot_json(index.active_ballot()))
}

fn cast(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let id: PollId = parse_arg(args, 0, "poll id")?;
    let selection: u8 = parse_arg(args, 1, "selection")?;
    index.cast(id, selection)?;
    Ok(json!({ "poll": id, "selection": selection }))
}

fn confirm(index: &mut VoteIndex) -> Result<Value> {
    let poll = index.active_poll().clone();
    let ready = index.validate(&poll, false);
    Ok(json!({ "ready": ready }))
}

fn submit_poll(index: &mut VoteIndex) -> Result<Value> {
    let txid = index.submit_active()?;
    Ok(json!({ "txid": txid }))
}

fn poll_info(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let poll = match args.first() {
        Some(raw) => {
            let id: PollId = raw
                .parse()
                .map_err(|_| invalid("argument poll id did not parse"))?;
            index
                .drafts()
                .get(&id)
                .or_else(|| index.confirmed().get(&id))
                .ok_or_else(|| invalid(format!("unknown poll {id}")))?
                .clone()
        }
        None => index.active_poll().clone(),
    };
    Ok(poll_json(index, &poll))
}

fn ballot_info(index: &mut VoteIndex) -> Result<Value> {
    Ok(ballot_json(index.active_ballot()))
}

fn tally(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let id: PollId = parse_arg(args, 0, "poll id")?;
    let Some(poll) = index.confirmed().get(&id) else {
        return Err(invalid(format!("unknown poll {id}")));
    };

    let columns: Vec<Value> = poll
        .options
        .iter()
        .zip(&poll.tally)
        .map(|(option, t)| {
            json!({
                "option": option,
                "pos": t.pos,
                "fpos": t.fpos,
                "pow": t.pow,
                "donation": t.donation,
            })
        })
        .collect();

    let is_local = index.is_local(id);
    Ok(json!({
        "id": id,
        "tally": columns,
        "consensus": poll.consensus_ratio(is_local),
        "approved": poll.is_approved(is_local),
        "fully_approved": poll.is_fully_approved(is_local),
    }))
}

fn get_active(index: &mut VoteIndex) -> Result<Value> {
    let cursor = index.cursor();
    Ok(json!({ "poll": cursor.poll_id, "ballot": cursor.ballot_id }))
}

enum ListKind {
    Active,
    Complete,
    Upcoming,
}

fn page_of(polls: Vec<Value>, args: &[String]) -> Result<Value> {
    let page: usize = match args.first() {
        Some(raw) => raw
            .parse()
            .map_err(|_| invalid("argument page did not parse"))?,
        None => 1,
    };
    if page == 0 {
        return Err(invalid("pages are numbered from 1"));
    }
    let total = polls.len();
    let entries: Vec<Value> = polls
        .into_iter()
        .skip((page - 1) * PAGE_SIZE)
        .take(PAGE_SIZE)
        .collect();
    Ok(json!({ "page": page, "total": total, "polls": entries }))
}

fn list_polls(index: &mut VoteIndex, args: &[String], kind: ListKind) -> Result<Value> {
    let now = index.now();
    let entries: Vec<Value> = index
        .confirmed()
        .iter()
        .filter(|(id, _)| **id != 0)
        .filter(|(_, poll)| match kind {
            ListKind::Active => poll.is_active(now),
            ListKind::Complete => poll.has_ended(now),
            ListKind::Upcoming => poll.start >= now,
        })
        .map(|(_, poll)| poll_json(index, poll))
        .collect();
    page_of(entries, args)
}

fn list_local(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let entries: Vec<Value> = index
        .drafts()
        .iter()
        .filter(|(id, _)| **id != 0)
        .map(|(_, poll)| poll_json(index, poll))
        .collect();
    page_of(entries, args)
}

enum SearchField {
    Name,
    Question,
}

fn search(index: &mut VoteIndex, args: &[String], field: SearchField) -> Result<Value> {
    let needle = arg(args, 0, "search text")?.to_lowercase();
    let entries: Vec<Value> = index
        .confirmed()
        .iter()
        .filter(|(id, _)| **id != 0)
        .filter(|(_, poll)| {
            let haystack = match field {
                SearchField::Name => &poll.name,
                SearchField::Question => &poll.question,
            };
            haystack.to_lowercase().contains(&needle)
        })
        .map(|(_, poll)| poll_json(index, poll))
        .collect();
    page_of(entries, &args[1..])
}

fn remove(index: &mut VoteIndex, args: &[String]) -> Result<Value> {
    let id: PollId = parse_arg(args, 0, "poll id")?;
    index.remove_poll(id)?;
    Ok(json!({ "removed": id }))
}
