//! On-chain poll subsystem: a compressed wire codec for poll records, a
//! ballot tally engine with reorg-safe undo, and a sled-backed registry of
//! confirmed polls, local drafts and wallet ballots.

pub mod codec;
pub mod commands;
pub mod error;
pub mod poll;
pub mod registry;
pub mod store;
pub mod tally;
pub mod timing;

pub use codec::{adler32, decode, encode, MAX_POLL_WIRE, POLL_HEADER_SIZE, POLL_INFO_SIZE};
pub use error::{PollError, Result};
pub use poll::{
    Ballot, OptionId, Poll, PollFlags, PollId, PollTime, Tally, DONATION_RATIO_USES_POS_ACCEPTANCE,
    POLL_ADDRESS_SIZE, POLL_ID_SIZE, POLL_MAX_OPTIONS, POLL_NAME_SIZE, POLL_OPTION_SIZE,
    POLL_QUESTION_SIZE, PRECISION,
};
pub use registry::{
    ActiveCursor, ChainSubmitter, VoteIndex, WalletKeys, SET_BALLOT, SET_CLEAR, SET_POLL,
};
pub use store::{LoadedRecords, SledVoteDb, VoteDb};
pub use tally::{
    apply_ballots, apply_donation, pack_ballots, select_ballots, unpack_ballots, verify_ballots,
    ProofType, COIN, MAX_BALLOTS_PER_BLOCK,
};
pub use timing::{ChainView, EPOCH_SPAN_BLOCKS, YEARLY_BLOCKCOUNT};
