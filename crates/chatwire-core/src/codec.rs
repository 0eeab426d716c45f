//! Payload codecs — typed values to bytes and back.
//!
//! Two strategies:
//!   1. Fixed layout: plain-data records with no indirection are copied
//!      byte-for-byte. The zerocopy derives (`AsBytes`, `FromBytes`) prove at
//!      compile time that the type has no pointers and no padding.
//!   2. Structured: everything else goes through serde_json. Field names are
//!      carried on the wire in camelCase: object keys are rewritten from
//!      snake_case on pack and back on unpack, at every nesting level.
//!      Types that name their own keys (serde `rename`/`rename_all`, or
//!      maps with arbitrary string keys) use `Codec::structured_verbatim`.
//!
//! A type picks its strategy once, in `Packet::codec`. The `CodecCache`
//! derives each codec at most once and hands out the same instance after.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use zerocopy::{AsBytes, FromBytes};

/// A value that can travel over the transport.
///
/// ```
/// use chatwire_core::codec::{Codec, CodecError, Packet};
/// use zerocopy::{AsBytes, FromBytes, FromZeroes};
///
/// #[derive(Debug, PartialEq, AsBytes, FromBytes, FromZeroes)]
/// #[repr(C)]
/// struct Ping {
///     client_ticks: i64,
/// }
///
/// impl Packet for Ping {
///     fn codec() -> Result<Codec<Self>, CodecError> {
///         Codec::fixed()
///     }
/// }
///
/// let codec = Ping::codec().unwrap();
/// let bytes = codec.pack(&Ping { client_ticks: 42 }).unwrap();
/// assert_eq!(codec.unpack(&bytes).unwrap(), Ping { client_ticks: 42 });
/// ```
pub trait Packet: Sized + Send + Sync + 'static {
    /// Fully-qualified name the type id is derived from.
    ///
    /// Defaults to `std::any::type_name`, whose output is not guaranteed
    /// stable across compiler versions. Override it when peers may be built
    /// with different toolchains.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Derive the packer/unpacker pair for this type.
    fn codec() -> Result<Codec<Self>, CodecError>;
}

/// Which strategy a codec uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Raw copy of exactly `size` bytes.
    Fixed { size: usize },
    /// serde_json text, keys normalized to camelCase.
    Structured,
    /// serde_json text, keys as serde produced them.
    Verbatim,
}

type PackFn<T> = fn(&T) -> Result<Vec<u8>, CodecError>;
type UnpackFn<T> = fn(&[u8]) -> Result<T, CodecError>;

/// Packer/unpacker pair for one type.
pub struct Codec<T> {
    layout: Layout,
    pack: PackFn<T>,
    unpack: UnpackFn<T>,
}

impl<T> Codec<T> {
    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn pack(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        (self.pack)(value)
    }

    pub fn unpack(&self, bytes: &[u8]) -> Result<T, CodecError> {
        (self.unpack)(bytes)
    }
}

impl<T: AsBytes + FromBytes> Codec<T> {
    /// Raw-copy codec for a fixed-layout record.
    ///
    /// Zero-sized types are refused: their "bytes" cannot be told apart from
    /// an absent payload, and registering one is a programming error.
    pub fn fixed() -> Result<Self, CodecError> {
        if std::mem::size_of::<T>() == 0 {
            return Err(CodecError::ZeroSized(std::any::type_name::<T>()));
        }
        Ok(Self {
            layout: Layout::Fixed {
                size: std::mem::size_of::<T>(),
            },
            pack: pack_fixed::<T>,
            unpack: unpack_fixed::<T>,
        })
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> {
    /// serde_json codec for anything with variable-size fields.
    ///
    /// Rust field names are expected to be snake_case; the wire carries
    /// them as camelCase.
    pub fn structured() -> Self {
        Self {
            layout: Layout::Structured,
            pack: pack_structured::<T>,
            unpack: unpack_structured::<T>,
        }
    }

    /// serde_json codec that leaves object keys untouched.
    pub fn structured_verbatim() -> Self {
        Self {
            layout: Layout::Verbatim,
            pack: pack_verbatim::<T>,
            unpack: unpack_verbatim::<T>,
        }
    }
}

impl<T> Clone for Codec<T> {
    fn clone(&self) -> Self {
        Self {
            layout: self.layout,
            pack: self.pack,
            unpack: self.unpack,
        }
    }
}

impl<T> fmt::Debug for Codec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("type", &std::any::type_name::<T>())
            .field("layout", &self.layout)
            .finish()
    }
}

fn pack_fixed<T: AsBytes>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(value.as_bytes().to_vec())
}

fn unpack_fixed<T: FromBytes>(bytes: &[u8]) -> Result<T, CodecError> {
    T::read_from(bytes).ok_or(CodecError::SizeMismatch {
        expected: std::mem::size_of::<T>(),
        actual: bytes.len(),
    })
}

fn pack_structured<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let tree = rewrite_keys(serde_json::to_value(value)?, &snake_to_camel);
    Ok(serde_json::to_vec(&tree)?)
}

fn unpack_structured<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let tree: Value = serde_json::from_slice(bytes)?;
    Ok(serde_json::from_value(rewrite_keys(tree, &camel_to_snake))?)
}

fn pack_verbatim<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

fn unpack_verbatim<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn rewrite_keys(value: Value, rename: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, inner)| (rename(&key), rewrite_keys(inner, rename)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|inner| rewrite_keys(inner, rename))
                .collect(),
        ),
        other => other,
    }
}

/// `player_name` → `playerName`. An underscore not followed by a lowercase
/// letter is kept, so `slot_2` survives the trip back.
fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '_' {
            if let Some(&next) = chars.peek() {
                if next.is_ascii_lowercase() {
                    out.push(next.to_ascii_uppercase());
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// `playerName` → `player_name`.
fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

// ── Cache ─────────────────────────────────────────────────────────────────────

/// Per-type codec cache, owned by whoever owns the registry.
///
/// Derivation runs under the map's entry lock, so concurrent first use of a
/// type still derives exactly one codec.
#[derive(Default)]
pub struct CodecCache {
    codecs: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl CodecCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the codec for `T`, deriving it on first use.
    pub fn get<T: Packet>(&self) -> Result<Arc<Codec<T>>, CodecError> {
        let key = TypeId::of::<T>();
        if let Some(existing) = self.codecs.get(&key) {
            return downcast::<T>(existing.value().clone());
        }

        match self.codecs.entry(key) {
            Entry::Occupied(occupied) => downcast::<T>(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let codec = Arc::new(T::codec()?);
                tracing::debug!(
                    type_name = T::type_name(),
                    layout = ?codec.layout(),
                    "codec derived"
                );
                vacant.insert(codec.clone());
                Ok(codec)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Drop every cached codec (teardown / reload).
    pub fn clear(&self) {
        self.codecs.clear();
    }
}

fn downcast<T: Packet>(erased: Arc<dyn Any + Send + Sync>) -> Result<Arc<Codec<T>>, CodecError> {
    erased
        .downcast::<Codec<T>>()
        .map_err(|_| CodecError::TypeConfusion(T::type_name()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{0} is zero-sized and cannot use the fixed-layout codec")]
    ZeroSized(&'static str),

    #[error("fixed-layout payload is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("structured payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("codec cache entry for {0} holds a different type")]
    TypeConfusion(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
