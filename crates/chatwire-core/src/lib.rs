//! chatwire-core — wire format, type identifiers, frame tags, and payload codecs.
//! The stateful transport in chatwire-net builds on this crate.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod wire;

pub use codec::{Codec, CodecCache, CodecError, Layout, Packet};
pub use wire::{Direction, Frame, FrameHeader, Role};
