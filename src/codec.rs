//! Wire codec for polls carried in chain transactions.
//!
//! Layout: a two-byte info header (poll marker bit, option count, 12-bit
//! compressed-stream length), the poll id, flags and timing in the clear,
//! then the descriptive fields zero-padded to fixed widths and carried as a
//! zlib stream. The zlib trailer doubles as the payload checksum.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{malformed, Result};
use crate::poll::{
    Poll, PollFlags, Tally, POLL_ADDRESS_SIZE, POLL_ID_SIZE, POLL_MAX_OPTIONS, POLL_NAME_SIZE,
    POLL_OPTION_SIZE, POLL_QUESTION_SIZE,
};

/// Info header: marker/op-count byte plus the low length byte.
pub const POLL_INFO_SIZE: usize = 2;
const POLL_FLAG_SIZE: usize = 1;
const POLL_TIME_SIZE: usize = 2;
/// Clear-text prefix: info header, id, flags, start, end.
pub const POLL_HEADER_SIZE: usize =
    POLL_INFO_SIZE + POLL_ID_SIZE + POLL_FLAG_SIZE + 2 * POLL_TIME_SIZE;
/// Hard cap on an encoded poll. The widest legal payload (six options)
/// is 423 bytes before compression; this leaves room for incompressible
/// input plus the zlib envelope.
pub const MAX_POLL_WIRE: usize = POLL_HEADER_SIZE + 500;

/// Shortest legal wire poll: header, minimal zlib stream, checksum.
const MIN_POLL_WIRE: usize = POLL_HEADER_SIZE + 5 + 2 + 4;

const ZLIB_CMF: u8 = 0x78;
/// FLG byte for best-compression streams; anything else is rejected as
/// unofficial even when it would inflate.
const ZLIB_FLG_BEST: u8 = 0xDA;

/// Adler-32 over `data`, the checksum zlib trails its streams with.
pub fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65_521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(5_552) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

fn padded(field: &str, width: usize, what: &str) -> Result<Vec<u8>> {
    let bytes = field.as_bytes();
    if bytes.len() > width {
        return Err(malformed(format!(
            "{what} exceeds {width} bytes ({} given)",
            bytes.len()
        )));
    }
    let mut out = vec![0u8; width];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn unpadded(bytes: &[u8], what: &str) -> Result<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| malformed(format!("{what} is not valid utf-8")))
}

fn expected_payload_len(op_count: usize) -> usize {
    POLL_NAME_SIZE + POLL_QUESTION_SIZE + op_count * POLL_OPTION_SIZE + POLL_ADDRESS_SIZE
}

/// Serialize a poll for inclusion in a transaction script.
///
/// The compressed stream is decompressed again before the bytes are
/// returned; a poll that cannot round-trip is refused rather than emitted.
pub fn encode(poll: &Poll) -> Result<Vec<u8>> {
    if poll.options.len() > POLL_MAX_OPTIONS {
        return Err(malformed(format!(
            "poll carries {} options, wire limit is {POLL_MAX_OPTIONS}",
            poll.options.len()
        )));
    }

    let mut payload = Vec::with_capacity(expected_payload_len(poll.options.len()));
    payload.extend(padded(&poll.name, POLL_NAME_SIZE, "poll name")?);
    payload.extend(padded(&poll.question, POLL_QUESTION_SIZE, "poll question")?);
    for option in &poll.options {
        payload.extend(padded(option, POLL_OPTION_SIZE, "poll option")?);
    }
    payload.extend(padded(&poll.address, POLL_ADDRESS_SIZE, "poll address")?);

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(&payload)
        .and_then(|_| encoder.finish())
        .map_err(|e| malformed(format!("compression failed: {e}")))
        .and_then(|stream| {
            let mut check = Vec::new();
            ZlibDecoder::new(stream.as_slice())
                .read_to_end(&mut check)
                .map_err(|e| malformed(format!("compression self-check failed: {e}")))?;
            if check != payload {
                return Err(malformed("compression self-check mismatch"));
            }
            Ok(stream)
        })
        .and_then(|stream| {
            if POLL_HEADER_SIZE + stream.len() > MAX_POLL_WIRE {
                return Err(malformed("encoded poll exceeds wire limit"));
            }

            let mut raw = Vec::with_capacity(POLL_HEADER_SIZE + stream.len());
            let size = stream.len() as u16;
            let mut info = (size >> 8) as u8; // low nibble of the high byte
            info |= 1 << 7;
            info |= (poll.options.len() as u8) << 4;
            raw.push(info);
            raw.push((size & 0x00FF) as u8);
            raw.extend_from_slice(&poll.id.to_le_bytes());
            raw.push(poll.flags.bits());
            raw.extend_from_slice(&poll.start.to_le_bytes());
            raw.extend_from_slice(&poll.end.to_le_bytes());
            raw.extend_from_slice(&stream);
            Ok(raw)
        })
}

/// Parse a wire poll. Purely structural: the caller decides what to do with
/// the result (duplicate ids, chain context, validation).
pub fn decode(raw: &[u8]) -> Result<Poll> {
    if raw.len() < MIN_POLL_WIRE {
        return Err(malformed("poll payload below minimum size"));
    }
    if raw[0] & (1 << 7) == 0 {
        return Err(malformed("poll marker bit missing"));
    }
    if raw[POLL_HEADER_SIZE] != ZLIB_CMF {
        return Err(malformed("unexpected zlib CMF byte"));
    }
    if raw[POLL_HEADER_SIZE + 1] != ZLIB_FLG_BEST {
        return Err(malformed("unofficial zlib FLG byte"));
    }

    let op_count = usize::from((raw[0] >> 4) & 0x07);
    let stream_len = (usize::from(raw[0] & 0x0F) << 8) | usize::from(raw[1]);
    let total = POLL_HEADER_SIZE + stream_len;
    if total > MAX_POLL_WIRE {
        return Err(malformed("declared poll size exceeds wire limit"));
    }
    if raw.len() != total {
        return Err(malformed("declared poll size disagrees with payload"));
    }

    let mut cursor = POLL_INFO_SIZE;
    let id = u32::from_le_bytes([
        raw[cursor],
        raw[cursor + 1],
        raw[cursor + 2],
        raw[cursor + 3],
    ]);
    cursor += POLL_ID_SIZE;
    let flags = PollFlags(raw[cursor]);
    cursor += POLL_FLAG_SIZE;
    let start = u16::from_le_bytes([raw[cursor], raw[cursor + 1]]);
    cursor += POLL_TIME_SIZE;
    let end = u16::from_le_bytes([raw[cursor], raw[cursor + 1]]);

    let stream = &raw[POLL_HEADER_SIZE..];
    let mut payload = Vec::with_capacity(expected_payload_len(op_count));
    let mut decoder = ZlibDecoder::new(stream).take(MAX_POLL_WIRE as u64);
    decoder
        .read_to_end(&mut payload)
        .map_err(|e| malformed(format!("zlib stream rejected: {e}")))?;

    let trailer = &stream[stream.len() - 4..];
    let declared = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if adler32(&payload) != declared {
        return Err(malformed("adler32 checksum mismatch"));
    }

    if payload.len() != expected_payload_len(op_count) {
        return Err(malformed(
            "decompressed payload disagrees with declared option count",
        ));
    }

    let mut offset = 0;
    let name = unpadded(&payload[offset..offset + POLL_NAME_SIZE], "poll name")?;
    offset += POLL_NAME_SIZE;
    let question = unpadded(
        &payload[offset..offset + POLL_QUESTION_SIZE],
        "poll question",
    )?;
    offset += POLL_QUESTION_SIZE;

    let mut options = Vec::with_capacity(op_count);
    for _ in 0..op_count {
        options.push(unpadded(
            &payload[offset..offset + POLL_OPTION_SIZE],
            "poll option",
        )?);
        offset += POLL_OPTION_SIZE;
    }
    let address = unpadded(&payload[offset..offset + POLL_ADDRESS_SIZE], "poll address")?;

    Ok(Poll {
        id,
        name,
        question,
        flags,
        start,
        end,
        tally: vec![Tally::default(); options.len()],
        options,
        address,
        hash: String::new(),
        height: 0,
    })
}
