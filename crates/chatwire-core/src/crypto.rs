//! Frame authentication for chatwire.
//!
//! Every frame carries a truncated keyed BLAKE3 tag over its body. Both peers
//! derive the tag key from the same shared secret. The tag gives integrity
//! and authenticity only; frame contents travel in the clear.
//!
//! Key material derives ZeroizeOnDrop, wiped from memory when dropped.
//! There is no unsafe code in this module.

use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::wire::{Frame, WireError, PREFIX, TAG_BYTES, TAG_HEX_LEN};

/// Domain-separation context for the tag key. Changing it breaks
/// compatibility with every deployed peer.
const TAG_KEY_CONTEXT: &str = "chatwire 2026-01 frame tag v1";

/// Key used to tag and verify frame bodies.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FrameKey {
    key: [u8; 32],
}

impl FrameKey {
    /// Derive the tag key from a shared secret of any length.
    pub fn derive(shared_secret: &[u8]) -> Self {
        Self {
            key: blake3::derive_key(TAG_KEY_CONTEXT, shared_secret),
        }
    }

    fn raw_tag(&self, body: &str) -> [u8; TAG_BYTES] {
        let full = blake3::keyed_hash(&self.key, body.as_bytes());
        let mut tag = [0u8; TAG_BYTES];
        tag.copy_from_slice(&full.as_bytes()[..TAG_BYTES]);
        tag
    }

    /// Tag a body: 16 uppercase hex characters.
    pub fn tag(&self, body: &str) -> String {
        hex::encode_upper(self.raw_tag(body))
    }

    /// Check a received tag against the body. Hex case is ignored.
    pub fn verify(&self, body: &str, tag_hex: &str) -> bool {
        if tag_hex.len() != TAG_HEX_LEN {
            return false;
        }
        let mut received = [0u8; TAG_BYTES];
        if hex::decode_to_slice(tag_hex, &mut received).is_err() {
            return false;
        }
        constant_time_eq(&self.raw_tag(body), &received)
    }
}

impl std::fmt::Debug for FrameKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameKey(..)")
    }
}

fn constant_time_eq(a: &[u8; TAG_BYTES], b: &[u8; TAG_BYTES]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Render a frame as one chat line: `PREFIX body|tag`.
pub fn seal(key: &FrameKey, frame: &Frame<'_>) -> String {
    let body = frame.body();
    let tag = key.tag(&body);
    let mut line = String::with_capacity(PREFIX.len() + body.len() + 1 + tag.len());
    line.push_str(PREFIX);
    line.push_str(&body);
    line.push('|');
    line.push_str(&tag);
    line
}

/// Strip the prefix, split off the tag at the last `|`, and verify it.
///
/// Returns the authenticated body. Nothing in the body is parsed before the
/// tag checks out.
pub fn open<'a>(key: &FrameKey, line: &'a str) -> Result<&'a str, AuthError> {
    let rest = line.strip_prefix(PREFIX).ok_or(WireError::MissingPrefix)?;
    let (body, tag) = rest.rsplit_once('|').ok_or(WireError::MissingTag)?;
    if !key.verify(body, tag) {
        return Err(AuthError::TagMismatch);
    }
    Ok(body)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("frame tag does not match body")]
    TagMismatch,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
