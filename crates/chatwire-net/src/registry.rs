//! Type registry — maps payload type ids to direction-tagged handlers.
//!
//! A handler is registered against a statically-typed closure. At
//! registration the closure is wrapped together with the type's codec into a
//! type-erased `Handler` taking raw bytes, so dispatch needs nothing but the
//! type id from the frame.

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use chatwire_core::codec::{CodecCache, CodecError, Packet};
use chatwire_core::wire::{type_id, Direction};

use crate::channel::PeerId;

/// Type-erased handler: unpack bytes, call the typed closure.
pub type Handler = Arc<dyn Fn(&PeerId, &[u8]) -> Result<(), DispatchError> + Send + Sync>;

/// One registered payload type.
///
/// Entries are replaced, never mutated in place: re-registering a type swaps
/// a new `Arc<Entry>` into the map, so a dispatch already holding the old one
/// finishes against a consistent snapshot.
#[derive(Clone)]
pub struct Entry {
    type_id: u32,
    type_name: &'static str,
    rust_type: TypeId,
    serverbound: Option<Handler>,
    clientbound: Option<Handler>,
}

impl Entry {
    fn new(type_id: u32, type_name: &'static str, rust_type: TypeId) -> Self {
        Self {
            type_id,
            type_name,
            rust_type,
            serverbound: None,
            clientbound: None,
        }
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Is this entry registered for the Rust type `T`?
    pub fn is<T: 'static>(&self) -> bool {
        self.rust_type == TypeId::of::<T>()
    }

    /// Is there a handler for payloads travelling in `direction`?
    pub fn accepts(&self, direction: Direction) -> bool {
        self.handler(direction).is_some()
    }

    fn handler(&self, direction: Direction) -> Option<&Handler> {
        match direction {
            Direction::Serverbound => self.serverbound.as_ref(),
            Direction::Clientbound => self.clientbound.as_ref(),
        }
    }

    fn set_handler(&mut self, direction: Direction, handler: Handler) {
        match direction {
            Direction::Serverbound => self.serverbound = Some(handler),
            Direction::Clientbound => self.clientbound = Some(handler),
        }
    }

    /// Unpack `bytes` and run the handler for `direction`.
    ///
    /// Panics inside the handler are caught and reported as
    /// `DispatchError::Panicked`, so one bad handler cannot take down the
    /// caller's receive loop.
    pub fn invoke(
        &self,
        direction: Direction,
        sender: &PeerId,
        bytes: &[u8],
    ) -> Result<(), DispatchError> {
        let handler = self.handler(direction).ok_or(DispatchError::NoHandler {
            type_id: self.type_id,
            direction,
        })?;
        match catch_unwind(AssertUnwindSafe(|| handler(sender, bytes))) {
            Ok(result) => result,
            Err(payload) => Err(DispatchError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("type_id", &self.type_id)
            .field("type_name", &self.type_name)
            .field("serverbound", &self.serverbound.is_some())
            .field("clientbound", &self.clientbound.is_some())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Registry of payload types, owned by the process and shared with the
/// transport. Starts empty; `clear` on teardown or reload.
pub struct Registry {
    entries: DashMap<u32, Arc<Entry>>,
    codecs: Arc<CodecCache>,
    lookups: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_codecs(Arc::new(CodecCache::new()))
    }

    /// Share an existing codec cache.
    pub fn with_codecs(codecs: Arc<CodecCache>) -> Self {
        Self {
            entries: DashMap::new(),
            codecs,
            lookups: AtomicU64::new(0),
        }
    }

    pub fn codecs(&self) -> &Arc<CodecCache> {
        &self.codecs
    }

    /// Register `handler` for `T` travelling in `direction`.
    ///
    /// Re-registering the same type and direction replaces the handler.
    /// A different Rust type landing on an already-taken id, whether by
    /// sharing a wire name or by a hash collision, is rejected with `RegistryError::Collision` instead of silently
    /// stealing its messages. Codec derivation happens here, so a type that
    /// cannot use its declared layout fails now rather than at send time.
    pub fn register<T, F>(&self, direction: Direction, handler: F) -> Result<u32, RegistryError>
    where
        T: Packet,
        F: Fn(&PeerId, T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let codec = self.codecs.get::<T>()?;
        let name = T::type_name();
        let id = type_id(name);

        let erased: Handler = Arc::new(move |sender: &PeerId, bytes: &[u8]| {
            let value = codec.unpack(bytes)?;
            handler(sender, value).map_err(DispatchError::Handler)
        });

        match self.entries.entry(id) {
            MapEntry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if !existing.is::<T>() {
                    return Err(RegistryError::Collision {
                        type_id: id,
                        existing: existing.type_name,
                        incoming: name,
                    });
                }
                let mut next = Entry::clone(existing);
                next.set_handler(direction, erased);
                occupied.insert(Arc::new(next));
            }
            MapEntry::Vacant(vacant) => {
                let mut entry = Entry::new(id, name, TypeId::of::<T>());
                entry.set_handler(direction, erased);
                vacant.insert(Arc::new(entry));
            }
        }

        tracing::info!(type_name = name, type_id = id, ?direction, "payload type registered");
        Ok(id)
    }

    /// Register both directions of `T` at once.
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
        self.register::<T, _>(Direction::Serverbound, server_handler)?;
        self.register::<T, _>(Direction::Clientbound, client_handler)
    }

    /// Remove `T`. Later messages of that type are dropped silently.
    pub fn unregister<T: Packet>(&self) -> bool {
        let name = T::type_name();
        let removed = self
            .entries
            .remove_if(&type_id(name), |_, entry| entry.is::<T>())
            .is_some();
        if removed {
            tracing::info!(type_name = name, "payload type unregistered");
        }
        removed
    }

    /// O(1) average lookup by id.
    pub fn lookup(&self, id: u32) -> Option<Arc<Entry>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    /// How many lookups have been made. Frames dropped before dispatch
    /// never reach the registry.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn type_ids(&self) -> Vec<u32> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every registration (teardown / reload).
    pub fn clear(&self) {
        self.entries.clear();
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cannot derive codec: {0}")]
    Codec(#[from] CodecError),

    #[error("type id {type_id} of {incoming} is already taken by {existing}")]
    Collision {
        type_id: u32,
        existing: &'static str,
        incoming: &'static str,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no {direction:?} handler for type id {type_id}")]
    NoHandler { type_id: u32, direction: Direction },

    #[error("payload did not unpack: {0}")]
    Codec(#[from] CodecError),

    #[error("handler failed: {0}")]
    Handler(anyhow::Error),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
