//! chatwire wire format — the text frames carried over the chat channel.
//!
//! One frame is one chat message:
//!
//! ```text
//! <PREFIX><msgId>|<index>/<total>|<typeId>|<base64Chunk>|<tag>
//! ```
//!
//! Everything up to and including the chunk is the frame *body*; the tag is
//! computed over the body (see `crypto`). The constants below are the
//! protocol. Both peers must agree on every one of them.

use static_assertions::const_assert;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Marker that distinguishes transport traffic from ordinary chat text.
/// Starts with a zero-width space so it renders invisibly.
pub const PREFIX: &str = "\u{200B}#BCN:";

/// Hard size limit of one chat message, in bytes.
pub const MAX_CHAT_BYTES: usize = 512;

/// Bytes reserved per frame for everything that is not payload chunk.
pub const HEADER_RESERVE: usize = 64;

/// Default base64 chunk budget per frame.
pub const SAFE_PAYLOAD_BYTES: usize = MAX_CHAT_BYTES - HEADER_RESERVE;

/// Truncated tag length in bytes, and its hex rendering.
pub const TAG_BYTES: usize = 8;
pub const TAG_HEX_LEN: usize = TAG_BYTES * 2;

/// Message ids are rendered as fixed-width uppercase hex.
pub const MSG_ID_WIDTH: usize = 8;

/// Upper bound on parts per message. Bounds the width of `index/total`.
pub const MAX_PARTS: usize = 9999;

/// Default idle lifetime of a partial reassembly buffer.
pub const BUFFER_LIFETIME_SECS: u64 = 10;

const MAX_PARTS_DIGITS: usize = 4;
const MAX_TYPE_ID_DIGITS: usize = 10; // u32::MAX = 4294967295
const SEPARATORS: usize = 4; // three in the body, one before the tag

/// Worst-case framing overhead of one frame: prefix, id, `index/total`,
/// type id, separators, and tag.
pub const MAX_HEADER_BYTES: usize = PREFIX.len()
    + MSG_ID_WIDTH
    + (MAX_PARTS_DIGITS * 2 + 1)
    + MAX_TYPE_ID_DIGITS
    + SEPARATORS
    + TAG_HEX_LEN;

// If either of these fails, a full-size chunk no longer fits in one message.
const_assert!(HEADER_RESERVE >= MAX_HEADER_BYTES);
const_assert!(SAFE_PAYLOAD_BYTES > 0);

// ── Type identifiers ──────────────────────────────────────────────────────────

const FNV_OFFSET: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over raw bytes.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, b| (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Stable identifier of a payload type, derived from its fully-qualified name.
///
/// 0 means "no such type" in lookups, so a raw hash of 0 is remapped to 1.
pub fn type_id(type_name: &str) -> u32 {
    fnv1a_32(type_name.as_bytes()).max(1)
}

// ── Direction & role ──────────────────────────────────────────────────────────

/// Which way a payload type travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    /// Client → server. Only the server role acts on it.
    Serverbound = 0,
    /// Server → client. Only the client role acts on it.
    Clientbound = 1,
}

impl TryFrom<u8> for Direction {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Direction::Serverbound),
            1 => Ok(Direction::Clientbound),
            other => Err(WireError::UnknownDirection(other)),
        }
    }
}

impl From<Direction> for u8 {
    fn from(d: Direction) -> u8 {
        d as u8
    }
}

/// Which end of the chat channel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// The direction this role acts on when receiving.
    pub fn accepts(self) -> Direction {
        match self {
            Role::Server => Direction::Serverbound,
            Role::Client => Direction::Clientbound,
        }
    }

    /// The direction of everything this role sends.
    pub fn sends(self) -> Direction {
        match self {
            Role::Server => Direction::Clientbound,
            Role::Client => Direction::Serverbound,
        }
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Header fields of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sender-scoped id shared by every part of one message.
    pub msg_id: u32,
    /// Zero-based part index.
    pub index: u16,
    /// Total number of parts in the message.
    pub total: u16,
    /// Registered type id of the payload.
    pub type_id: u32,
}

/// One parsed frame body. The chunk borrows from the received line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub chunk: &'a str,
}

impl<'a> Frame<'a> {
    /// Render the body: `msgId|index/total|typeId|chunk`.
    pub fn body(&self) -> String {
        let h = &self.header;
        format!(
            "{:0width$X}|{}/{}|{}|{}",
            h.msg_id,
            h.index,
            h.total,
            h.type_id,
            self.chunk,
            width = MSG_ID_WIDTH
        )
    }

    /// Parse an authenticated body back into its fields.
    pub fn parse(body: &'a str) -> Result<Self, WireError> {
        let fields: Vec<&str> = body.splitn(4, '|').collect();
        if fields.len() != 4 {
            return Err(WireError::FieldCount(fields.len()));
        }
        let (id, part, type_id, chunk) = (fields[0], fields[1], fields[2], fields[3]);

        if id.len() != MSG_ID_WIDTH || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(WireError::BadInteger("msg_id"));
        }
        let msg_id = u32::from_str_radix(id, 16).map_err(|_| WireError::BadInteger("msg_id"))?;

        let (index, total) = part.split_once('/').ok_or(WireError::FieldCount(3))?;
        let index: u16 = parse_decimal(index, "index")?;
        let total: u16 = parse_decimal(total, "total")?;
        if total == 0 || usize::from(total) > MAX_PARTS {
            return Err(WireError::TooManyParts(usize::from(total)));
        }
        if index >= total {
            return Err(WireError::PartOutOfRange { index, total });
        }

        let type_id: u32 = parse_decimal(type_id, "type_id")?;

        if !chunk.bytes().all(is_base64_byte) {
            return Err(WireError::BadChunk);
        }

        Ok(Frame {
            header: FrameHeader {
                msg_id,
                index,
                total,
                type_id,
            },
            chunk,
        })
    }
}

/// Does this chat line carry transport traffic?
pub fn has_prefix(line: &str) -> bool {
    line.starts_with(PREFIX)
}

fn parse_decimal<T: std::str::FromStr>(s: &str, field: &'static str) -> Result<T, WireError> {
    // FromStr accepts a leading '+', the wire format does not.
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WireError::BadInteger(field));
    }
    s.parse().map_err(|_| WireError::BadInteger(field))
}

fn is_base64_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("line does not start with the transport prefix")]
    MissingPrefix,

    #[error("frame has no authentication tag")]
    MissingTag,

    #[error("expected 4 body fields, found {0}")]
    FieldCount(usize),

    #[error("unparsable {0} field")]
    BadInteger(&'static str),

    #[error("part index {index} out of range for {total} parts")]
    PartOutOfRange { index: u16, total: u16 },

    #[error("part count {0} outside 1..={}", MAX_PARTS)]
    TooManyParts(usize),

    #[error("chunk contains characters outside the base64 alphabet")]
    BadChunk,

    #[error("unknown direction byte: 0x{0:02x}")]
    UnknownDirection(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
