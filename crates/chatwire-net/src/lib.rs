//! chatwire-net — typed, fragmented, authenticated messaging over a chat channel.
//!
//! The pieces, leaves first:
//!   - `registry`: type id → direction-tagged handler
//!   - `reassembly`: splitting payloads and collecting parts back together
//!   - `channel`: the boundary to whatever physically sends a chat line
//!   - `transport`: framing, tags, the send path, and the receive state machine

pub mod channel;
pub mod reassembly;
pub mod registry;
pub mod transport;

pub use channel::{ChannelAdapter, PeerId, RecordingChannel, SendTarget, SentFrame};
pub use reassembly::{split, Accept, MessageKey, NetBuffer, PartRejected, PendingTable};
pub use registry::{DispatchError, Entry, Registry, RegistryError};
pub use transport::{DropReason, Inbound, Transport, TransportError, TransportStats};

pub use chatwire_core::{Direction, Packet, Role};
