//! Transport — framing, tags, the send path, and the receive state machine.
//!
//! Send: pack → base64 → split → one sealed frame per chunk → channel.
//!
//! Receive, per message:
//!
//! ```text
//! Unseen ──first valid part──▶ Accumulating ──last part──▶ Complete ──dispatch──▶ Discarded
//!                                   │
//!                                   └──idle > lifetime (sweep)──▶ Expired
//! ```
//!
//! Frames with a bad tag are dropped before they can create or touch a
//! buffer. Every failure on the receive side is a silent drop: the chat
//! channel also carries ordinary human text, and corruption in transit must
//! degrade to a lost message, never to an error in the host's chat loop.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use chatwire_core::codec::{CodecError, Packet};
use chatwire_core::config::{ChatwireConfig, ConfigError};
use chatwire_core::crypto::{self, FrameKey};
use chatwire_core::wire::{self, Direction, Frame, FrameHeader, Role, WireError, MAX_PARTS};

use crate::channel::{ChannelAdapter, PeerId, SendTarget};
use crate::reassembly::{split, Accept, PartRejected, PendingTable};
use crate::registry::{Registry, RegistryError};

/// What became of one received chat line. Informational only; the receive
/// path never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Not transport traffic.
    Ignored,
    /// Stored as part of a message still missing parts.
    Pending { msg_id: u32, received: u16, total: u16 },
    /// Completed a message and ran its handler.
    Dispatched { msg_id: u32, type_id: u32 },
    /// Discarded.
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Missing or mismatched tag.
    BadTag,
    /// Authenticated, but the body fields did not parse.
    Malformed(WireError),
    /// The part conflicted with its buffer.
    Rejected(PartRejected),
    /// The message already completed.
    Replayed,
    /// The joined payload was not valid base64.
    BadPayload,
    /// No registration for this type id.
    UnknownType(u32),
    /// Registered, but not for the direction this role receives.
    DirectionMismatch(u32),
    /// Unpack failed, or the handler returned an error or panicked.
    HandlerFailed(u32),
}

/// Snapshot of transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub dropped: u64,
    pub dispatched: u64,
    pub expired: u64,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    expired: AtomicU64,
}

/// One end of the chat-channel transport.
///
/// Owns the pending-message table and the frame key; shares the registry
/// and the channel with the host. Defines no threads of its own and never
/// blocks: sends and receives run on whatever thread calls them.
pub struct Transport {
    role: Role,
    config: ChatwireConfig,
    key: FrameKey,
    registry: Arc<Registry>,
    channel: Arc<dyn ChannelAdapter>,
    pending: PendingTable,
    next_msg_id: AtomicU32,
    counters: Counters,
}

impl Transport {
    pub fn new(
        role: Role,
        config: ChatwireConfig,
        registry: Arc<Registry>,
        channel: Arc<dyn ChannelAdapter>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let key = FrameKey::derive(config.auth.shared_key.as_bytes());
        tracing::info!(
            ?role,
            chunk_budget = config.channel.chunk_budget(),
            buffer_lifetime_secs = config.reassembly.buffer_lifetime_secs,
            "transport ready"
        );
        Ok(Self {
            role,
            config,
            key,
            registry,
            channel,
            pending: PendingTable::new(),
            next_msg_id: AtomicU32::new(1),
            counters: Counters::default(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ChatwireConfig {
        &self.config
    }

    // ── Registration ─────────────────────────────────────────────────────────

    /// Handle `T` sent by clients (acted on by the server role).
    pub fn register_serverbound<T, F>(&self, handler: F) -> Result<u32, RegistryError>
    where
        T: Packet,
        F: Fn(&PeerId, T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register::<T, F>(Direction::Serverbound, handler)
    }

    /// Handle `T` sent by the server (acted on by the client role).
    pub fn register_clientbound<T, F>(&self, handler: F) -> Result<u32, RegistryError>
    where
        T: Packet,
        F: Fn(&PeerId, T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.register::<T, F>(Direction::Clientbound, handler)
    }

    pub fn register_bidirectional<T, S, C>(
        &self,
        server_handler: S,
        client_handler: C,
    ) -> Result<u32, RegistryError>
    where
        T: Packet,
        S: Fn(&PeerId, T) -> anyhow::Result<()> + Send + Sync + 'static,
        C: Fn(&PeerId, T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry
            .register_bidirectional::<T, S, C>(server_handler, client_handler)
    }

    pub fn unregister<T: Packet>(&self) -> bool {
        self.registry.unregister::<T>()
    }

    // ── Send path ────────────────────────────────────────────────────────────

    /// Client → server.
    pub fn send_to_server<T: Packet>(&self, value: &T) -> Result<u32, TransportError> {
        self.send(value, SendTarget::Local)
    }

    /// Server → one client.
    pub fn send_to_client<T: Packet>(&self, peer: PeerId, value: &T) -> Result<u32, TransportError> {
        self.send(value, SendTarget::Peer(peer))
    }

    /// Server → every client.
    pub fn broadcast<T: Packet>(&self, value: &T) -> Result<u32, TransportError> {
        self.send(value, SendTarget::Broadcast)
    }

    /// Pack, split, seal, and emit `value`. Returns the message id.
    ///
    /// Every frame is built and size-checked before the first one is handed
    /// to the channel, so a failure never leaves a partial message on the
    /// wire.
    pub fn send<T: Packet>(&self, value: &T, target: SendTarget) -> Result<u32, TransportError> {
        self.check_target(target)?;

        let type_id = wire::type_id(T::type_name());
        let codec = self.registry.codecs().get::<T>()?;
        let bytes = codec.pack(value)?;
        let encoded = STANDARD.encode(&bytes);

        let chunks = split(&encoded, self.config.channel.chunk_budget());
        if chunks.len() > MAX_PARTS {
            return Err(TransportError::PayloadTooLarge {
                parts: chunks.len(),
                max: MAX_PARTS,
            });
        }
        let total = chunks.len() as u16;
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);

        let max = self.config.channel.max_chat_bytes;
        let mut lines = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.into_iter().enumerate() {
            let frame = Frame {
                header: FrameHeader {
                    msg_id,
                    index: index as u16,
                    total,
                    type_id,
                },
                chunk,
            };
            let line = crypto::seal(&self.key, &frame);
            if line.len() > max {
                return Err(TransportError::FrameTooLarge {
                    len: line.len(),
                    max,
                });
            }
            lines.push(line);
        }

        let direction = self.role.sends();
        for line in &lines {
            self.channel.send(direction, line, target);
        }
        self.counters
            .frames_sent
            .fetch_add(lines.len() as u64, Ordering::Relaxed);

        tracing::debug!(
            msg_id,
            type_id,
            type_name = T::type_name(),
            bytes = bytes.len(),
            parts = total,
            ?target,
            "message sent"
        );
        Ok(msg_id)
    }

    fn check_target(&self, target: SendTarget) -> Result<(), TransportError> {
        let allowed = match (self.role, target) {
            (Role::Client, SendTarget::Local) => true,
            (Role::Server, SendTarget::Peer(_) | SendTarget::Broadcast) => true,
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(TransportError::WrongRole {
                role: self.role,
                target,
            })
        }
    }

    // ── Receive path ─────────────────────────────────────────────────────────

    /// Feed one received chat line from `sender`.
    ///
    /// Call once per physically received message. Never fails: anything
    /// that is not a valid, complete, registered message for this role is
    /// dropped and reported in the return value.
    pub fn on_receive(&self, sender: PeerId, raw: &str) -> Inbound {
        if !wire::has_prefix(raw) {
            return Inbound::Ignored;
        }
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        self.sweep_at(now);

        let outcome = self.receive_frame(sender, raw, now);
        if let Inbound::Dropped(reason) = &outcome {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(%sender, ?reason, "frame dropped");
        }
        outcome
    }

    fn receive_frame(&self, sender: PeerId, raw: &str, now: Instant) -> Inbound {
        let body = match crypto::open(&self.key, raw) {
            Ok(body) => body,
            Err(_) => return Inbound::Dropped(DropReason::BadTag),
        };

        let frame = match Frame::parse(body) {
            Ok(frame) => frame,
            Err(e) => return Inbound::Dropped(DropReason::Malformed(e)),
        };
        let header = frame.header;

        match self
            .pending
            .accept((sender, header.msg_id), &header, frame.chunk, now)
        {
            Accept::Pending { received, total } => Inbound::Pending {
                msg_id: header.msg_id,
                received,
                total,
            },
            Accept::Rejected(rejected) => Inbound::Dropped(DropReason::Rejected(rejected)),
            Accept::Replayed => Inbound::Dropped(DropReason::Replayed),
            Accept::Complete(encoded) => self.dispatch(sender, header, &encoded),
        }
    }

    fn dispatch(&self, sender: PeerId, header: FrameHeader, encoded: &str) -> Inbound {
        let FrameHeader { msg_id, type_id, .. } = header;

        let bytes = match STANDARD.decode(encoded) {
            Ok(bytes) => bytes,
            Err(_) => return Inbound::Dropped(DropReason::BadPayload),
        };

        let Some(entry) = self.registry.lookup(type_id) else {
            tracing::debug!(msg_id, type_id, "no handler registered, dropping message");
            return Inbound::Dropped(DropReason::UnknownType(type_id));
        };

        let direction = self.role.accepts();
        if !entry.accepts(direction) {
            return Inbound::Dropped(DropReason::DirectionMismatch(type_id));
        }

        if let Err(e) = entry.invoke(direction, &sender, &bytes) {
            tracing::warn!(
                %sender,
                msg_id,
                type_name = entry.type_name(),
                error = %e,
                "message handler failed"
            );
            return Inbound::Dropped(DropReason::HandlerFailed(type_id));
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            %sender,
            msg_id,
            type_name = entry.type_name(),
            bytes = bytes.len(),
            "message dispatched"
        );
        Inbound::Dispatched { msg_id, type_id }
    }

    // ── Housekeeping ─────────────────────────────────────────────────────────

    /// Discard partial messages idle longer than the buffer lifetime.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// `sweep` against an explicit clock reading.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let expired = self
            .pending
            .sweep(now, self.config.reassembly.buffer_lifetime());
        if expired > 0 {
            self.counters
                .expired
                .fetch_add(expired as u64, Ordering::Relaxed);
            tracing::warn!(expired, "partial messages expired before completion");
        }
        expired
    }

    /// Partial messages currently buffered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    /// Drop all in-flight state. Registrations live in the registry and are
    /// cleared separately.
    pub fn shutdown(&self) {
        let pending = self.pending.len();
        self.pending.clear();
        tracing::info!(role = ?self.role, pending, "transport shut down");
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Local failures on the send side and at construction.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot pack payload: {0}")]
    Codec(#[from] CodecError),

    #[error("payload needs {parts} frames, limit is {max}")]
    PayloadTooLarge { parts: usize, max: usize },

    #[error("frame of {len} bytes exceeds the {max} byte chat limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("{role:?} role cannot send to {target:?}")]
    WrongRole { role: Role, target: SendTarget },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
